use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use ttyagent_core::{GatewayConfig, TicketStore};

/// Registry record for a live WebSocket connection. Sessions are owned by
/// their connection task; the registry only tracks who is connected.
pub struct SessionEntry {
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub tickets: Arc<TicketStore>,
    pub sessions: Arc<DashMap<Uuid, SessionEntry>>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let tickets = Arc::new(TicketStore::new(Duration::from_millis(
            config.ws_ticket_ttl_ms,
        )));
        Self {
            config: Arc::new(config),
            tickets,
            sessions: Arc::new(DashMap::new()),
        }
    }
}
