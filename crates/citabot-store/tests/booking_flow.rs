//! Cross-store flows: the payment-window lifecycle and the reminder
//! round trip, exercised against one shared in-memory database.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use citabot_store::bookings::NewBooking;
use citabot_store::db::open_in_memory;
use citabot_store::types::{
    BookingSource, BookingStatus, PatientInfo, PaymentRecord, PaymentStatus, ReminderSent,
};
use citabot_store::Stores;

fn stores() -> Stores {
    Stores::new(open_in_memory().unwrap())
}

fn new_booking(payment_required: bool) -> NewBooking {
    NewBooking {
        doctor_id: "acct-1".into(),
        patient: PatientInfo {
            name: "Juan Pérez".into(),
            phone: "5213319858734".into(),
            email: Some("juan@example.com".into()),
            reason: Some("dolor de espalda".into()),
        },
        appointment_at: Utc::now() + Duration::days(1),
        appointment_date: "lunes, 25 de julio de 2025".into(),
        appointment_time: "10:00 a.m.".into(),
        source: BookingSource::Chat,
        payment_required,
        calendar_id: Some("cal-1".into()),
        doctor_name: Some("Dra. García".into()),
        location: Some("Av. Siempre Viva 742".into()),
        specialty: None,
        consultation_price: payment_required.then_some(50_000),
        metadata: HashMap::new(),
    }
}

#[test]
fn payment_window_lifecycle() {
    let stores = stores();

    // Reservation: booking + checkout session + links.
    let booking = stores.bookings.create(new_booking(true)).unwrap();
    stores
        .payments
        .insert(&PaymentRecord {
            id: "cs_1".into(),
            account_id: "acct-1".into(),
            conversation_id: Some("acct-1_5213319858734".into()),
            booking_id: Some(booking.id.clone()),
            amount: 50_000,
            currency: "mxn".into(),
            status: PaymentStatus::Pending,
            checkout_url: "https://checkout.example.com/cs_1".into(),
            customer_name: Some("Juan Pérez".into()),
            customer_phone: Some("5213319858734".into()),
            appointment_id: None,
            source: "chat".into(),
            expires_at: Some(Utc::now() + Duration::minutes(30)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        })
        .unwrap();
    stores
        .bookings
        .link_payment(&booking.id, "cs_1", PaymentStatus::Pending)
        .unwrap();

    // While payment is pending there must be no CRM appointment.
    let pending = stores.bookings.get(&booking.id).unwrap().unwrap();
    assert!(pending.payment_required);
    assert_eq!(pending.payment_status, Some(PaymentStatus::Pending));
    assert!(pending.appointment_id.is_none());

    // Webhook lands: payment completes, appointment is created and linked.
    stores
        .bookings
        .set_payment_status(&booking.id, PaymentStatus::Completed)
        .unwrap();
    stores.bookings.link_appointment(&booking.id, "ghl-appt-1").unwrap();
    stores
        .payments
        .update_status("cs_1", PaymentStatus::Completed, Some("ghl-appt-1"))
        .unwrap();

    let confirmed = stores.bookings.get(&booking.id).unwrap().unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.payment_status, Some(PaymentStatus::Completed));
    assert_eq!(confirmed.appointment_id.as_deref(), Some("ghl-appt-1"));
    assert!(confirmed.confirmed_at.is_some());

    let payment = stores.payments.get("cs_1").unwrap().unwrap();
    assert_eq!(payment.appointment_id.as_deref(), Some("ghl-appt-1"));
}

#[test]
fn lost_race_marks_slot_unavailable_without_appointment() {
    let stores = stores();
    let booking = stores.bookings.create(new_booking(true)).unwrap();
    stores
        .bookings
        .link_payment(&booking.id, "cs_2", PaymentStatus::Pending)
        .unwrap();
    stores
        .bookings
        .set_payment_status(&booking.id, PaymentStatus::Completed)
        .unwrap();

    // Revalidation found the slot blocked: terminal state, no appointment.
    stores
        .bookings
        .set_status(&booking.id, BookingStatus::SlotUnavailable)
        .unwrap();

    let lost = stores.bookings.get(&booking.id).unwrap().unwrap();
    assert_eq!(lost.status, BookingStatus::SlotUnavailable);
    assert!(lost.appointment_id.is_none());
}

#[test]
fn reminder_round_trip_routes_next_message() {
    let stores = stores();
    let phone = "5213319858734";

    // Batch sends the reminder and opens the context.
    assert!(!stores.reminders.already_sent("appt-1").unwrap());
    stores
        .reminders
        .mark_sent(&ReminderSent {
            appointment_id: "appt-1".into(),
            contact_id: "contact-1".into(),
            contact_phone: phone.into(),
            appointment_time: Utc::now() + Duration::hours(4),
            sent_at: Utc::now(),
            account_id: "acct-1".into(),
            location_id: Some("loc-1".into()),
            calendar_id: Some("cal-1".into()),
        })
        .unwrap();

    // A second batch run skips the appointment.
    assert!(stores.reminders.already_sent("appt-1").unwrap());

    // The inbound router finds the context by canonical phone…
    let context = stores.reminders.active_context(phone).unwrap().unwrap();
    assert_eq!(context.appointment_id, "appt-1");

    // …and clears it once the patient confirms; the sent record stays so
    // no duplicate reminder goes out.
    stores.reminders.clear_context(&context.id).unwrap();
    assert!(stores.reminders.active_context(phone).unwrap().is_none());
    assert!(stores.reminders.already_sent("appt-1").unwrap());
}

#[test]
fn duplicate_webhook_claims_once_across_stores() {
    let stores = stores();
    assert!(stores.dedup.claim("acct-1", "wamid.X", "5213319858734"));
    assert!(!stores.dedup.claim("acct-1", "wamid.X", "5213319858734"));

    // The conversation layer sees exactly one session either way.
    let c1 = stores
        .conversations
        .get_or_create("acct-1", "5213319858734")
        .unwrap();
    let c2 = stores
        .conversations
        .get_or_create("acct-1", "5213319858734")
        .unwrap();
    assert_eq!(c1.id, c2.id);
}
