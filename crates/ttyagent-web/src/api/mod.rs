mod ticket;

pub use ticket::create_ws_ticket;

use axum::Json;

/// Health probe for the container orchestrator.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "name": "sealos-tty-agent", "ok": true }))
}
