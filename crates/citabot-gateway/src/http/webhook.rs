//! WhatsApp webhook ingress.
//!
//! GET handles the subscription handshake. POST always acknowledges with
//! 200 — failing a delivery only triggers platform redelivery storms; the
//! dedup store and our own logging carry correctness.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use citabot_whatsapp::types::InboundMessage;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;

/// GET /webhook — `hub.mode=subscribe` + matching token echoes the
/// challenge, anything else is a 403.
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, StatusCode> {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned();

    if mode == Some("subscribe") && token == Some(state.config.whatsapp.verify_token.as_str()) {
        info!("webhook verification succeeded");
        return Ok(challenge.unwrap_or_default());
    }
    warn!(?mode, "webhook verification rejected");
    Err(StatusCode::FORBIDDEN)
}

/// POST /webhook — parse, dispatch, and ACK no matter what.
pub async fn inbound_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    let Some(message) = InboundMessage::from_webhook(&payload) else {
        // Status callbacks and unsupported types are acknowledged quietly.
        return Json(json!({"status": "ignored"}));
    };

    info!(
        message_id = %message.message_id,
        from = %message.from_number,
        kind = ?message.message_type,
        "inbound message"
    );

    if let Err(e) = state.engine.handle_inbound(&message).await {
        // Internal failures are logged, never surfaced as non-2xx.
        warn!(message_id = %message.message_id, error = %e, "inbound processing failed");
    }

    Json(json!({"status": "received"}))
}
