//! API-key-protected tenant operations: payments onboarding, the
//! idempotent status probe, and one-shot phone registration.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::{error_response, require_api_key};

type HandlerResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Deserialize, Default)]
pub struct OnboardRequest {
    pub return_url: Option<String>,
    pub refresh_url: Option<String>,
}

/// POST /accounts/{id}/payments/onboard — create the connected account if
/// needed and hand back a hosted onboarding link. The connected-account id
/// is persisted immediately, before the hosted flow runs, so webhooks
/// arriving mid-onboarding can be matched.
pub async fn start_payments_onboarding(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<OnboardRequest>>,
) -> HandlerResult {
    require_api_key(&state, &headers)?;
    let engine = &state.engine;
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let account = engine
        .stores
        .accounts
        .get(&account_id)
        .map_err(internal)?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND", "account not found")
        })?;

    let email = account.email.clone().ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "account email is required for payments onboarding",
        )
    })?;

    let connected_id = match account.payments.connected_account_id.clone() {
        Some(id) => id,
        None => {
            let created = engine
                .payments
                .create_connected_account(&email)
                .await
                .map_err(bad_gateway)?;

            let mut payments = account.payments.clone();
            payments.connected_account_id = Some(created.id.clone());
            payments.enabled = true;
            engine
                .stores
                .accounts
                .update_payments(&account.id, &payments)
                .map_err(internal)?;
            info!(%account_id, connected_account_id = %created.id, "connected account persisted");
            created.id
        }
    };

    let base = &state.config.whatsapp.callback_uri;
    let return_url = request
        .return_url
        .unwrap_or_else(|| format!("{base}/payments/onboarding-complete"));
    let refresh_url = request
        .refresh_url
        .unwrap_or_else(|| format!("{base}/accounts/{account_id}/payments/onboard"));

    let url = engine
        .payments
        .create_account_link(&connected_id, &refresh_url, &return_url)
        .await
        .map_err(bad_gateway)?;

    Ok(Json(json!({
        "account_id": account_id,
        "connected_account_id": connected_id,
        "onboarding_url": url,
    })))
}

/// GET /accounts/{id}/payments/status — probe the processor and persist
/// the capability flags. Safe to call repeatedly.
pub async fn payments_status(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> HandlerResult {
    require_api_key(&state, &headers)?;
    let engine = &state.engine;

    let account = engine
        .stores
        .accounts
        .get(&account_id)
        .map_err(internal)?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND", "account not found")
        })?;

    let Some(connected_id) = account.payments.connected_account_id.clone() else {
        return Ok(Json(json!({
            "connected": false,
            "message": "No payment account connected",
        })));
    };

    let status = engine
        .payments
        .get_account_status(&connected_id)
        .await
        .map_err(bad_gateway)?;

    let mut payments = account.payments.clone();
    payments.charges_enabled = status.charges_enabled;
    payments.payouts_enabled = status.payouts_enabled;
    payments.details_submitted = status.details_submitted;
    if status.charges_enabled && status.details_submitted {
        payments.onboarding_completed = true;
    }
    engine
        .stores
        .accounts
        .update_payments(&account.id, &payments)
        .map_err(internal)?;

    Ok(Json(json!({
        "connected": true,
        "connected_account_id": connected_id,
        "charges_enabled": status.charges_enabled,
        "payouts_enabled": status.payouts_enabled,
        "details_submitted": status.details_submitted,
        "onboarding_completed": payments.onboarding_completed,
    })))
}

#[derive(Deserialize)]
pub struct RegisterPhoneRequest {
    #[serde(default = "default_pin")]
    pub pin: String,
    pub data_localization_region: Option<String>,
}

fn default_pin() -> String {
    "000000".to_string()
}

/// POST /accounts/{id}/phone/register — one-shot Cloud API registration.
pub async fn register_phone(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RegisterPhoneRequest>,
) -> HandlerResult {
    require_api_key(&state, &headers)?;
    let engine = &state.engine;

    let account = engine
        .stores
        .accounts
        .get(&account_id)
        .map_err(internal)?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND", "account not found")
        })?;

    let result = engine
        .whatsapp
        .register_phone(
            &account.phone_number_id,
            &request.pin,
            request.data_localization_region.as_deref(),
        )
        .await
        .map_err(|e| {
            warn!(%account_id, error = %e, "phone registration failed");
            bad_gateway(e)
        })?;

    Ok(Json(json!({"account_id": account_id, "result": result})))
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        &e.to_string(),
    )
}

fn bad_gateway(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error_response(
        StatusCode::BAD_GATEWAY,
        "EXTERNAL_SERVICE_ERROR",
        &e.to_string(),
    )
}
