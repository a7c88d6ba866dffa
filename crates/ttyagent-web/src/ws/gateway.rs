use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::session;

#[derive(Debug, Deserialize)]
pub struct ExecQuery {
    /// Single-use ticket; may instead arrive in the first `auth` frame.
    ticket: Option<String>,
}

/// `GET /exec`: upgrades to the per-session WebSocket. The origin check
/// runs before the upgrade is accepted; a rejected origin never gets a
/// WebSocket handshake.
pub async fn exec_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ExecQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.origin_allowed(origin) {
        tracing::warn!(peer = %peer, origin = ?origin, "rejected upgrade: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    let max_payload = state.config.ws_max_payload;
    ws.max_message_size(max_payload)
        .max_frame_size(max_payload)
        .on_upgrade(move |socket| session::run(socket, state, query.ticket, peer))
        .into_response()
}
