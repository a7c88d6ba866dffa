use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header;
use axum::Json;
use serde::{Deserialize, Serialize};

use ttyagent_core::target::ExecTarget;
use ttyagent_core::ticket::IssuerMeta;

use crate::error::AppError;
use crate::state::AppState;

/// Slack on top of the kubeconfig cap for the JSON envelope around it.
const BODY_ENVELOPE_MARGIN: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TicketRequest {
    kubeconfig: String,
    namespace: String,
    pod: String,
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    command: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketResponse {
    ok: bool,
    ticket: String,
    expires_at: u64,
}

/// Issues a single-use, short-lived ticket binding the posted kubeconfig
/// and target to a future `/exec` WebSocket. The ticket replaces passing
/// credentials in the upgrade URL, where they would leak into server
/// logs, browser history, and Referer headers.
pub async fn create_ws_ticket(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Json<TicketResponse>, AppError> {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let limit = state.config.ws_ticket_max_kubeconfig_bytes + BODY_ENVELOPE_MARGIN;
    let bytes = match axum::body::to_bytes(request.into_body(), limit).await {
        Ok(bytes) => bytes,
        Err(e) if is_length_limit(&e) => {
            return Err(AppError::PayloadTooLarge("Payload too large.".to_string()));
        }
        Err(e) => {
            return Err(AppError::Internal(format!(
                "failed to read request body: {e}"
            )));
        }
    };

    let body: TicketRequest = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::BadRequest(format!("Invalid request body: {e}")))?;

    let kubeconfig = body.kubeconfig.trim().to_string();
    if kubeconfig.is_empty() {
        return Err(AppError::BadRequest("kubeconfig is required.".to_string()));
    }
    if kubeconfig.len() > state.config.ws_ticket_max_kubeconfig_bytes {
        return Err(AppError::PayloadTooLarge("kubeconfig too large.".to_string()));
    }

    let target = ExecTarget::new(
        &body.namespace,
        &body.pod,
        body.container.as_deref(),
        body.command.as_deref(),
    )
    .map_err(|e| AppError::BadRequest(format!("{e}.")))?;

    let issued = state.tickets.issue(
        kubeconfig,
        target,
        IssuerMeta {
            remote_addr: peer.to_string(),
            user_agent,
        },
    );

    Ok(Json(TicketResponse {
        ok: true,
        ticket: issued.ticket,
        expires_at: issued.expires_at,
    }))
}

/// Whether a body-read error came from the size cap (413) rather than a
/// transport failure (500).
fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}
