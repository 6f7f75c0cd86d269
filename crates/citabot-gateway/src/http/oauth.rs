//! CRM OAuth install / reauthorization flow.
//!
//! Token-refresh failures surface to operators as a 401 carrying the
//! authorize URL; walking that URL lands back on the callback here, which
//! exchanges the code and stores a fresh token pair.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::{error_response, require_api_key};

const AUTHORIZE_SCOPES: &str =
    "contacts.readonly contacts.write calendars.readonly calendars/events.readonly calendars/events.write";

/// Build the hosted authorize URL for a tenant. Returned both from the
/// explicit admin route and inside 401 token-error responses.
pub fn authorize_url(state: &AppState, oauth_state: &str) -> String {
    let config = &state.config;
    format!(
        "{}/oauth/chooselocation?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        config.crm.base_url,
        config.crm.client_id,
        urlencoding::encode(&format!("{}/oauth/callback", config.whatsapp.callback_uri)),
        urlencoding::encode(AUTHORIZE_SCOPES),
        oauth_state,
    )
}

/// GET /oauth/authorize?account_id=… — admin-triggered (re)install.
pub async fn start_authorize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Redirect, (StatusCode, Json<Value>)> {
    require_api_key(&state, &headers)?;

    let account_id = params.get("account_id").map(String::as_str);
    let oauth_state = state
        .engine
        .stores
        .tokens
        .create_oauth_state(account_id)
        .map_err(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                &e.to_string(),
            )
        })?;

    Ok(Redirect::temporary(&authorize_url(&state, &oauth_state)))
}

/// GET /oauth/callback?code=…&state=… — exchange the code and persist the
/// token pair for the tenant bound to the state nonce.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let code = params.get("code").ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "missing code")
    })?;
    let oauth_state = params.get("state").ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "missing state")
    })?;

    let bound_account = state
        .engine
        .stores
        .tokens
        .consume_oauth_state(oauth_state)
        .map_err(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                &e.to_string(),
            )
        })?;

    let Some(account_id) = bound_account.flatten() else {
        warn!("oauth callback with unknown or expired state");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "AUTHENTICATION_ERROR",
            "unknown or expired oauth state",
        ));
    };

    let redirect_uri = format!("{}/oauth/callback", state.config.whatsapp.callback_uri);
    state
        .engine
        .crm
        .auth()
        .exchange_code(&account_id, code, Some(&redirect_uri))
        .await
        .map_err(|e| {
            warn!(%account_id, error = %e, "code exchange failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "EXTERNAL_SERVICE_ERROR",
                "authorization code exchange failed",
            )
        })?;

    info!(%account_id, "CRM authorization completed");
    Ok(Json(json!({
        "success": true,
        "account_id": account_id,
        "message": "Authorization complete. The assistant can reach the calendar again.",
    })))
}
