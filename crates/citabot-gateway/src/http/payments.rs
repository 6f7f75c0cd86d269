//! Payment-processor webhook routes. Two endpoints, two secrets: platform
//! (patient payments) and subscription billing.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Html;
use axum::Json;
use chrono::{DateTime, Utc};
use citabot_payments::events::{EventKind, WebhookEvent};
use citabot_payments::webhook::verify_signature;
use citabot_store::types::{PaymentStatus, SubscriptionBlock, SubscriptionRow, SubscriptionStatus};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::error_response;

/// POST /webhooks/payments — patient-payment events from connected
/// accounts. Bad signatures get 400; everything after verification is
/// acknowledged with 2xx, replays included.
pub async fn payments_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let event = verified_event(&headers, &body, &state.config.payments.webhook_secret)?;

    info!(event_id = %event.id, event_type = %event.event_type, "payment webhook");

    let result = match event.kind() {
        EventKind::AccountUpdated => handle_account_updated(&state, &event).await,
        EventKind::CapabilityUpdated => handle_capability_updated(&state, &event).await,
        EventKind::CheckoutSessionCompleted => handle_checkout_completed(&state, &event).await,
        other => {
            info!(?other, "unhandled payment event type");
            Ok(())
        }
    };

    if let Err(e) = result {
        // Internal replay errors must not trigger redelivery; idempotency
        // keys in the booking store carry correctness.
        warn!(event_id = %event.id, error = %e, "payment webhook processing failed");
    }
    Ok(Json(json!({"received": true})))
}

/// POST /webhooks/subscriptions — billing lifecycle events, verified
/// against the separate subscription secret.
pub async fn subscriptions_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let event = verified_event(
        &headers,
        &body,
        &state.config.payments.subscription_webhook_secret,
    )?;

    info!(event_id = %event.id, event_type = %event.event_type, "subscription webhook");

    let result = match event.kind() {
        EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
            sync_subscription(&state, &event, false).await
        }
        EventKind::SubscriptionDeleted => sync_subscription(&state, &event, true).await,
        EventKind::InvoicePaymentSucceeded => {
            info!(event_id = %event.id, "invoice payment succeeded");
            Ok(())
        }
        EventKind::InvoicePaymentFailed => {
            // The past_due transition arrives via the subscription.updated
            // event; this one is informational.
            warn!(event_id = %event.id, "invoice payment failed");
            Ok(())
        }
        other => {
            info!(?other, "unhandled subscription event type");
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(event_id = %event.id, error = %e, "subscription webhook processing failed");
    }
    Ok(Json(json!({"received": true})))
}

fn verified_event(
    headers: &HeaderMap,
    body: &Bytes,
    secret: &str,
) -> Result<WebhookEvent, (StatusCode, Json<Value>)> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "missing signature header",
            )
        })?;

    verify_signature(body, signature, secret, Utc::now().timestamp()).map_err(|e| {
        warn!(error = %e, "webhook signature rejected");
        error_response(StatusCode::BAD_REQUEST, "AUTHENTICATION_ERROR", "invalid signature")
    })?;

    WebhookEvent::parse(body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            &format!("unparseable event: {e}"),
        )
    })
}

// ── Connect account lifecycle ─────────────────────────────────────────────────

/// `account.updated`: match by email first, then by the persisted
/// connected-account id, and refresh the capability flags.
async fn handle_account_updated(
    state: &AppState,
    event: &WebhookEvent,
) -> Result<(), citabot_core::AppError> {
    let stores = &state.engine.stores;
    let connected_id = event.account.clone().or_else(|| {
        event
            .object_str("id")
            .map(String::from)
    });

    let account = match event.object_str("email") {
        Some(email) => stores.accounts.get_by_email(email)?,
        None => None,
    };
    let account = match account {
        Some(a) => Some(a),
        None => match connected_id.as_deref() {
            Some(id) => stores.accounts.get_by_connected_account(id)?,
            None => None,
        },
    };

    let Some(account) = account else {
        warn!(
            connected_account = ?connected_id,
            email = ?event.object_str("email"),
            "no tenant matches payment account"
        );
        return Ok(());
    };

    let mut payments = account.payments.clone();
    payments.connected_account_id = connected_id.or(payments.connected_account_id);
    payments.charges_enabled = event.object_bool("charges_enabled");
    payments.payouts_enabled = event.object_bool("payouts_enabled");
    payments.details_submitted = event.object_bool("details_submitted");
    payments.capability_status = event
        .data
        .object
        .pointer("/capabilities/card_payments")
        .and_then(|v| v.as_str())
        .map(String::from);
    payments.last_webhook_at = Some(Utc::now());
    if payments.charges_enabled && payments.details_submitted {
        payments.onboarding_completed = true;
        payments.enabled = true;
    }

    stores.accounts.update_payments(&account.id, &payments)?;
    info!(account_id = %account.id, "payment capability flags updated");
    Ok(())
}

async fn handle_capability_updated(
    state: &AppState,
    event: &WebhookEvent,
) -> Result<(), citabot_core::AppError> {
    let stores = &state.engine.stores;
    let Some(connected_id) = event.account.as_deref() else {
        return Ok(());
    };
    let Some(account) = stores.accounts.get_by_connected_account(connected_id)? else {
        warn!(%connected_id, "capability update for unknown tenant");
        return Ok(());
    };

    let mut payments = account.payments.clone();
    payments.capability_status = event
        .object_str("status")
        .map(String::from)
        .or(payments.capability_status);
    payments.last_webhook_at = Some(Utc::now());
    stores.accounts.update_payments(&account.id, &payments)?;
    Ok(())
}

// ── Checkout completion ───────────────────────────────────────────────────────

/// `checkout.session.completed`: mark the payment row, then finalize.
/// `metadata.booking_id` is the canonical key for directory bookings;
/// chat-flow sessions carry `conversation_id`.
async fn handle_checkout_completed(
    state: &AppState,
    event: &WebhookEvent,
) -> Result<(), citabot_core::AppError> {
    let engine = &state.engine;
    let stores = &engine.stores;
    let session_id = event
        .object_str("id")
        .ok_or_else(|| citabot_core::AppError::Validation("session without id".into()))?;

    if let Err(e) = stores
        .payments
        .update_status(session_id, PaymentStatus::Completed, None)
    {
        warn!(%session_id, error = %e, "payment row not found for completed session");
    }

    let source = event.metadata("source").unwrap_or_default();
    let booking_id = event.metadata("booking_id");
    let conversation_id = event.metadata("conversation_id");

    if source != "chat" {
        // Directory flow: the booking row is authoritative.
        if let Some(booking_id) = booking_id {
            stores
                .bookings
                .set_payment_status(booking_id, PaymentStatus::Completed)?;
            let outcome = engine.finalize_directory_booking(booking_id).await?;
            info!(%booking_id, ?outcome, "directory booking processed after payment");
        }
        return Ok(());
    }

    // Chat flow: advance the conversation draft and book.
    let Some(conversation_id) = conversation_id else {
        warn!(%session_id, "chat payment without conversation_id metadata");
        return Ok(());
    };
    let Some(mut conversation) = stores.conversations.get(conversation_id)? else {
        warn!(%conversation_id, "conversation gone for completed payment");
        return Ok(());
    };
    let Some(account) = stores.accounts.get(&conversation.account_id)? else {
        return Ok(());
    };

    if let Some(mut draft) = conversation.context.appointment.clone() {
        draft.payment_status = Some(PaymentStatus::Completed);
        draft.payment_id = Some(session_id.to_string());
        if let Some(booking_id) = &draft.booking_id {
            stores
                .bookings
                .set_payment_status(booking_id, PaymentStatus::Completed)?;
        }
        conversation.context.appointment = Some(draft);
        conversation.context.awaiting_confirmation = true;
        stores.conversations.update(&mut conversation)?;
    }

    let outcome = engine
        .finalize_from_conversation(&account, conversation_id, Some(session_id))
        .await?;
    info!(%conversation_id, ?outcome, "chat booking processed after payment");
    Ok(())
}

// ── Subscription sync ─────────────────────────────────────────────────────────

async fn sync_subscription(
    state: &AppState,
    event: &WebhookEvent,
    deleted: bool,
) -> Result<(), citabot_core::AppError> {
    let stores = &state.engine.stores;
    let object = &event.data.object;

    let subscription_id = object
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| citabot_core::AppError::Validation("subscription without id".into()))?;
    let customer_id = object
        .get("customer")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let status: SubscriptionStatus = if deleted {
        SubscriptionStatus::Canceled
    } else {
        object
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(SubscriptionStatus::Incomplete)
    };

    let period_end: Option<DateTime<Utc>> = object
        .get("current_period_end")
        .and_then(|v| v.as_i64())
        .and_then(|t| DateTime::from_timestamp(t, 0));
    let tier_id = object
        .pointer("/metadata/tier_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    // Lookup by billing customer; fall back to the account id the
    // checkout flow stamped into the subscription metadata (the customer
    // id is not persisted locally until the first sync).
    let account = match stores.accounts.get_by_billing_customer(customer_id)? {
        Some(account) => account,
        None => {
            let by_metadata = object
                .pointer("/metadata/account_id")
                .and_then(|v| v.as_str())
                .map(|id| stores.accounts.get(id))
                .transpose()?
                .flatten();
            match by_metadata {
                Some(account) => account,
                None => {
                    warn!(%customer_id, "subscription event for unknown customer");
                    return Ok(());
                }
            }
        }
    };

    stores.subscriptions.sync(&SubscriptionRow {
        id: subscription_id.to_string(),
        account_id: account.id.clone(),
        customer_id: customer_id.to_string(),
        status,
        tier_id: tier_id.clone(),
        current_period_end: period_end,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    })?;

    let block = SubscriptionBlock {
        customer_id: Some(customer_id.to_string()),
        tier_id: tier_id.or(account.subscription.tier_id.clone()),
        status: Some(status),
        current_period_end: period_end,
        is_free_account: account.subscription.is_free_account,
        free_account_reason: account.subscription.free_account_reason.clone(),
        free_account_expires: account.subscription.free_account_expires,
        products_override: account.subscription.products_override.clone(),
    };
    stores.accounts.update_subscription(&account.id, &block)?;

    info!(account_id = %account.id, %status, "subscription synced");
    Ok(())
}

// ── Hosted-checkout landing pages ─────────────────────────────────────────────

pub async fn payment_success_page() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html><html><head><title>Pago recibido</title></head>\
         <body style=\"font-family: sans-serif; text-align: center; padding: 48px\">\
         <h1>✅ ¡Pago recibido!</h1>\
         <p>Tu cita será confirmada por WhatsApp en unos momentos.</p>\
         <p>Ya puedes cerrar esta ventana.</p></body></html>",
    )
}

pub async fn payment_cancel_page() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html><html><head><title>Pago cancelado</title></head>\
         <body style=\"font-family: sans-serif; text-align: center; padding: 48px\">\
         <h1>Pago cancelado</h1>\
         <p>No se realizó ningún cargo. Puedes volver al chat para intentarlo de nuevo.</p>\
         </body></html>",
    )
}
