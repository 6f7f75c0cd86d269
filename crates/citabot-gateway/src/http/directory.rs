//! Public doctor directory: search, per-day availability, and direct-slot
//! bookings that funnel into the same pipeline as the chat flow.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use citabot_core::phone::normalize_phone;
use citabot_engine::pipeline::FinalizeOutcome;
use citabot_engine::slots;
use citabot_payments::client::CheckoutParams;
use citabot_store::bookings::NewBooking;
use citabot_store::types::{BookingSource, PatientInfo, PaymentRecord, PaymentStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::error_response;

type HandlerResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Deserialize)]
pub struct DoctorSearchQuery {
    pub specialty: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub radius_km: Option<f64>,
}

/// GET /directory/doctors — enabled profiles, by specialty and geo radius.
pub async fn list_doctors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DoctorSearchQuery>,
) -> HandlerResult {
    let near = match (query.lat, query.lng) {
        (Some(lat), Some(lng)) => Some((lat, lng, query.radius_km.unwrap_or(25.0))),
        _ => None,
    };

    let doctors = state
        .engine
        .stores
        .directory
        .search(query.specialty.as_deref(), near)
        .map_err(internal)?;

    Ok(Json(json!({"success": true, "data": doctors})))
}

#[derive(Deserialize)]
pub struct AvailabilityQuery {
    pub date: String,
}

/// GET /directory/doctors/{id}/availability?date=YYYY-MM-DD — free slots
/// for the day with blocked ones filtered out.
pub async fn doctor_availability(
    State(state): State<Arc<AppState>>,
    Path(doctor_id): Path<String>,
    Query(query): Query<AvailabilityQuery>,
) -> HandlerResult {
    let engine = &state.engine;
    let tz = engine.tz();

    let date = NaiveDate::parse_from_str(&query.date, "%Y-%m-%d").map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "date must be YYYY-MM-DD",
        )
    })?;

    let (profile, account) = load_doctor(state.as_ref(), &doctor_id)?;

    let day_start = tz
        .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()
        .ok_or_else(|| internal("invalid local day start"))?;
    let start_ms = day_start.timestamp_millis();
    let end_ms = start_ms + 24 * 60 * 60 * 1000;

    let free = engine
        .crm
        .get_free_slots(
            &account.id,
            &account.calendar_id,
            start_ms,
            end_ms,
            tz.name(),
            Some(&account.assigned_user_id),
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "availability fetch failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "EXTERNAL_SERVICE_ERROR",
                "could not fetch availability",
            )
        })?;

    let blocked = engine
        .crm
        .get_blocked_slots(
            &account.id,
            &account.location_id,
            Some(&account.calendar_id),
            Some(&account.assigned_user_id),
            start_ms,
            end_ms,
        )
        .await;

    let options = slots::to_slot_options(&free, tz);
    let formatted: Vec<Value> = options
        .iter()
        .filter(|o| o.date == query.date)
        .map(|o| {
            let available = !slots::event_starts_at(&blocked, tz, &o.time);
            json!({
                "time": o.time,
                "datetime": o.datetime,
                "date": o.date,
                "display_time": o.display_time,
                "available": available,
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "data": {
            "doctor_id": profile.id,
            "date": query.date,
            "slots": formatted,
        }
    })))
}

#[derive(Deserialize)]
pub struct CreateBookingRequest {
    pub doctor_id: String,
    pub patient_info: PatientPayload,
    pub appointment_datetime: String,
}

#[derive(Deserialize)]
pub struct PatientPayload {
    pub name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /directory/bookings — create a booking; payment-enabled tenants
/// get a checkout link, the rest finalize immediately.
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBookingRequest>,
) -> HandlerResult {
    let engine = &state.engine;
    let tz = engine.tz();

    let phone = normalize_phone(&request.patient_info.phone).ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "invalid phone")
    })?;
    if !request.patient_info.email.contains('@') {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "invalid email",
        ));
    }
    if let Err(retry) = state.rate_limiter.check(&phone) {
        return Err(error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMIT_EXCEEDED",
            &format!("retry after {retry}s"),
        ));
    }

    let start_local = citabot_agent::extract::parse_local_datetime(&request.appointment_datetime, tz)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "appointment_datetime must be ISO 8601",
            )
        })?;

    let (profile, account) = load_doctor(state.as_ref(), &request.doctor_id)?;

    // First revalidation boundary: refuse the reservation when the slot is
    // already blocked.
    if slots::slot_taken(&engine.crm, &account, tz, start_local).await {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "BUSINESS_LOGIC_ERROR",
            citabot_engine::messages::SLOT_UNAVAILABLE_BEFORE_PAYMENT,
        ));
    }

    let (date_str, time_str) = slots::format_spanish(start_local);
    let weekday = spanish_weekday(start_local.weekday());
    let payment_required = account.payments_functional() && account.payments.charges_enabled;

    let booking = engine
        .stores
        .bookings
        .create(NewBooking {
            doctor_id: profile.id.clone(),
            patient: PatientInfo {
                name: request.patient_info.name.clone(),
                phone: phone.clone(),
                email: Some(request.patient_info.email.clone()),
                reason: request.patient_info.reason.clone(),
            },
            appointment_at: start_local.with_timezone(&Utc),
            appointment_date: format!("{weekday}, {date_str}"),
            appointment_time: time_str,
            source: BookingSource::Directory,
            payment_required,
            calendar_id: Some(account.calendar_id.clone()),
            doctor_name: Some(profile.full_name.clone()),
            location: profile.office_address.clone(),
            specialty: profile.specialty.clone(),
            consultation_price: payment_required.then(|| {
                profile
                    .consultation_price
                    .unwrap_or(account.payments.appointment_price)
            }),
            metadata: HashMap::from([
                (
                    "reason".to_string(),
                    json!(request.patient_info.reason.clone().unwrap_or_default()),
                ),
                ("account_id".to_string(), json!(account.id)),
            ]),
        })
        .map_err(internal)?;

    if payment_required {
        let connected = account
            .payments
            .connected_account_id
            .as_deref()
            .ok_or_else(|| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    "BUSINESS_LOGIC_ERROR",
                    "payments enabled but no connected account",
                )
            })?;

        let amount = booking
            .consultation_price
            .unwrap_or(account.payments.appointment_price);
        let session = engine
            .payments
            .create_checkout_session(CheckoutParams {
                connected_account_id: connected,
                amount,
                currency: &account.payments.currency,
                description: &account.payments.description,
                customer_name: &request.patient_info.name,
                customer_phone: &phone,
                success_url: &format!(
                    "{}/payment/success?booking_id={}",
                    state.config.whatsapp.callback_uri, booking.id
                ),
                cancel_url: &format!(
                    "{}/payment/cancel?booking_id={}",
                    state.config.whatsapp.callback_uri, booking.id
                ),
                metadata: vec![
                    ("booking_id", booking.id.clone()),
                    ("source", "directory".to_string()),
                ],
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "directory checkout session failed");
                error_response(
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_SERVICE_ERROR",
                    "payment session creation failed",
                )
            })?;

        engine
            .stores
            .payments
            .insert(&PaymentRecord {
                id: session.id.clone(),
                account_id: account.id.clone(),
                conversation_id: None,
                booking_id: Some(booking.id.clone()),
                amount,
                currency: account.payments.currency.clone(),
                status: PaymentStatus::Pending,
                checkout_url: session.url.clone(),
                customer_name: Some(request.patient_info.name.clone()),
                customer_phone: Some(phone),
                appointment_id: None,
                source: "directory".into(),
                expires_at: session
                    .expires_at
                    .and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                metadata: HashMap::new(),
            })
            .map_err(internal)?;
        engine
            .stores
            .bookings
            .link_payment(&booking.id, &session.id, PaymentStatus::Pending)
            .map_err(internal)?;

        info!(booking_id = %booking.id, "directory booking awaiting payment");
        return Ok(Json(json!({
            "success": true,
            "booking_id": booking.id,
            "requires_payment": true,
            "payment_url": session.url,
            "amount": amount,
            "currency": account.payments.currency,
        })));
    }

    // No payment gate: finalize right away.
    match engine.finalize_directory_booking(&booking.id).await {
        Ok(FinalizeOutcome::Confirmed { appointment_id, .. }) => Ok(Json(json!({
            "success": true,
            "booking_id": booking.id,
            "requires_payment": false,
            "appointment_id": appointment_id,
        }))),
        Ok(FinalizeOutcome::SlotUnavailable) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "BUSINESS_LOGIC_ERROR",
            citabot_engine::messages::SLOT_UNAVAILABLE_BEFORE_PAYMENT,
        )),
        Ok(FinalizeOutcome::PaymentPending) | Err(_) => {
            // The reservation row survives; operators follow up manually.
            warn!(booking_id = %booking.id, "direct finalization failed, booking left pending");
            Ok(Json(json!({
                "success": true,
                "booking_id": booking.id,
                "requires_payment": false,
                "warning": "Appointment creation pending, we will contact you to confirm",
            })))
        }
    }
}

/// POST /directory/bookings/{id}/payment-success — patient returned from
/// checkout. Idempotent against the webhook: whichever runs second finds
/// the appointment id already set.
pub async fn booking_payment_success(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
) -> HandlerResult {
    let engine = &state.engine;
    let booking = engine
        .stores
        .bookings
        .get(&booking_id)
        .map_err(internal)?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND", "booking not found")
        })?;

    if booking.payment_required && booking.payment_status != Some(PaymentStatus::Completed) {
        // The webhook has not landed yet; the frontend retries.
        return Err((
            StatusCode::ACCEPTED,
            Json(json!({
                "success": false,
                "retry": true,
                "message": "El pago aún no ha sido confirmado. Por favor espera un momento.",
            })),
        ));
    }

    match engine.finalize_directory_booking(&booking_id).await {
        Ok(FinalizeOutcome::Confirmed { appointment_id, details }) => Ok(Json(json!({
            "success": true,
            "appointment_id": appointment_id,
            "details": details,
        }))),
        Ok(FinalizeOutcome::SlotUnavailable) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "BUSINESS_LOGIC_ERROR",
            citabot_engine::messages::SLOT_UNAVAILABLE,
        )),
        Ok(FinalizeOutcome::PaymentPending) => Err((
            StatusCode::ACCEPTED,
            Json(json!({"success": false, "retry": true})),
        )),
        Err(e) => {
            warn!(%booking_id, error = %e, "payment-success finalization failed");
            Err(internal(e))
        }
    }
}

fn load_doctor(
    state: &AppState,
    doctor_id: &str,
) -> Result<
    (citabot_store::types::DirectoryProfile, citabot_store::types::Account),
    (StatusCode, Json<Value>),
> {
    let profile = state
        .engine
        .stores
        .directory
        .get(doctor_id)
        .map_err(internal)?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND", "doctor not found")
        })?;

    let account = state
        .engine
        .stores
        .accounts
        .get(&profile.account_id)
        .map_err(internal)?
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "BUSINESS_LOGIC_ERROR",
                "doctor account not configured",
            )
        })?;

    Ok((profile, account))
}

fn spanish_weekday(weekday: chrono::Weekday) -> &'static str {
    match weekday {
        chrono::Weekday::Mon => "lunes",
        chrono::Weekday::Tue => "martes",
        chrono::Weekday::Wed => "miércoles",
        chrono::Weekday::Thu => "jueves",
        chrono::Weekday::Fri => "viernes",
        chrono::Weekday::Sat => "sábado",
        chrono::Weekday::Sun => "domingo",
    }
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        &e.to_string(),
    )
}
