//! Booking finalization: the single path both channels funnel through,
//! synchronizing the payment lifecycle with the CRM appointment lifecycle.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use citabot_agent::extract::parse_local_datetime;
use citabot_core::config::APPOINTMENT_MINUTES;
use citabot_core::{AppError, Result};
use citabot_payments::client::CheckoutParams;
use citabot_store::types::{
    Account, Booking, BookingStatus, ConversationStatus, MessageRole, PaymentRecord, PaymentStatus,
};
use citabot_whatsapp::templates;
use tracing::{info, instrument, warn};

use crate::engine::Engine;
use crate::messages;
use crate::slots;

/// Result of a finalization attempt.
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Confirmed {
        appointment_id: String,
        details: String,
    },
    /// The slot was taken during the payment window. The booking is marked
    /// and the patient told to reschedule; no automatic retry.
    SlotUnavailable,
    /// Payments are required and the payment has not completed yet.
    PaymentPending,
}

#[derive(Debug, Clone)]
pub struct PaymentLink {
    pub payment_id: String,
    pub url: String,
    pub amount: i64,
    pub currency: String,
}

impl Engine {
    /// Create the checkout session for a chat-flow confirmation and link
    /// it to the booking and the conversation draft.
    #[instrument(skip(self, account, conversation), fields(account_id = %account.id, conversation_id = %conversation.id))]
    pub async fn create_payment_for_conversation(
        &self,
        account: &Account,
        conversation: &mut citabot_store::types::Conversation,
    ) -> Result<PaymentLink> {
        let Some(mut draft) = conversation.context.appointment.clone() else {
            return Err(AppError::Conversation(
                "no appointment information on conversation".into(),
            ));
        };
        let connected = account
            .payments
            .connected_account_id
            .as_deref()
            .ok_or_else(|| AppError::BusinessLogic("no connected payment account".into()))?;

        let customer_name = draft
            .name
            .clone()
            .or_else(|| conversation.context.user_name.clone())
            .unwrap_or_else(|| "Cliente".into());

        let mut metadata = vec![
            ("source", "chat".to_string()),
            ("conversation_id", conversation.id.clone()),
        ];
        if let Some(booking_id) = &draft.booking_id {
            metadata.push(("booking_id", booking_id.clone()));
        }

        let session = self
            .payments
            .create_checkout_session(CheckoutParams {
                connected_account_id: connected,
                amount: account.payments.appointment_price,
                currency: &account.payments.currency,
                description: &account.payments.description,
                customer_name: &customer_name,
                customer_phone: &conversation.phone_number,
                success_url: &format!(
                    "{}/payment/success?conversation_id={}",
                    self.config.whatsapp.callback_uri, conversation.id
                ),
                cancel_url: &format!(
                    "{}/payment/cancel?conversation_id={}",
                    self.config.whatsapp.callback_uri, conversation.id
                ),
                metadata,
            })
            .await
            .map_err(AppError::from)?;

        let amount = session.amount_total.unwrap_or(account.payments.appointment_price);
        let currency = session
            .currency
            .clone()
            .unwrap_or_else(|| account.payments.currency.clone());

        self.stores.payments.insert(&PaymentRecord {
            id: session.id.clone(),
            account_id: account.id.clone(),
            conversation_id: Some(conversation.id.clone()),
            booking_id: draft.booking_id.clone(),
            amount,
            currency: currency.clone(),
            status: PaymentStatus::Pending,
            checkout_url: session.url.clone(),
            customer_name: Some(customer_name),
            customer_phone: Some(conversation.phone_number.clone()),
            appointment_id: None,
            source: "chat".into(),
            expires_at: session
                .expires_at
                .and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        })?;

        if let Some(booking_id) = &draft.booking_id {
            self.stores
                .bookings
                .link_payment(booking_id, &session.id, PaymentStatus::Pending)?;
        }

        draft.payment_id = Some(session.id.clone());
        draft.payment_status = Some(PaymentStatus::Pending);
        conversation.context.appointment = Some(draft);
        conversation.context.awaiting_confirmation = true;
        self.stores.conversations.update(conversation)?;

        Ok(PaymentLink {
            payment_id: session.id,
            url: session.url,
            amount,
            currency,
        })
    }

    /// Finalize a chat-flow booking: revalidate the slot, reuse or create
    /// the contact, create (or, for reschedules, move) the CRM
    /// appointment, link everything, complete the conversation, and send
    /// the confirmation.
    ///
    /// Idempotent: when the booking already carries an appointment id the
    /// existing id is returned and nothing is created. The webhook and the
    /// success-callback can both call this safely.
    #[instrument(skip(self, account), fields(account_id = %account.id, %conversation_id))]
    pub async fn finalize_from_conversation(
        &self,
        account: &Account,
        conversation_id: &str,
        payment_id: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        let tz = self.tz();
        let mut conversation = self
            .stores
            .conversations
            .get(conversation_id)?
            .ok_or_else(|| AppError::not_found("Conversation", conversation_id))?;
        let Some(draft) = conversation.context.appointment.clone() else {
            return Err(AppError::Conversation(
                "no appointment information on conversation".into(),
            ));
        };

        // Payment gate: without an explicit payment reference, the stored
        // draft must show a completed payment.
        if account.payments_functional()
            && payment_id.is_none()
            && draft.payment_status != Some(PaymentStatus::Completed)
        {
            warn!("finalization requested before payment completed");
            return Ok(FinalizeOutcome::PaymentPending);
        }

        // Idempotency check against the authoritative booking row.
        if let Some(booking_id) = &draft.booking_id {
            if let Some(booking) = self.stores.bookings.get(booking_id)? {
                if let Some(appointment_id) = booking.appointment_id.clone() {
                    info!(%appointment_id, "booking already finalized, returning existing");
                    return Ok(FinalizeOutcome::Confirmed {
                        details: self.booking_details(&booking.patient.name, &draft_reason(&draft), &booking),
                        appointment_id,
                    });
                }
            }
        }

        let start_local = draft
            .datetime
            .as_deref()
            .and_then(|s| parse_local_datetime(s, tz))
            .ok_or_else(|| AppError::Conversation("draft has no usable datetime".into()))?;

        // Second revalidation boundary: the slot may have been taken while
        // the payment window was open.
        if slots::slot_taken(&self.crm, account, tz, start_local).await {
            warn!("slot taken during payment window");
            if let Some(booking_id) = &draft.booking_id {
                self.stores
                    .bookings
                    .set_status(booking_id, BookingStatus::SlotUnavailable)?;
            }
            let _ = self
                .send_text_response(
                    account,
                    &conversation.phone_number.clone(),
                    messages::SLOT_UNAVAILABLE,
                    Some(&mut conversation),
                )
                .await;
            return Ok(FinalizeOutcome::SlotUnavailable);
        }

        // Reuse the contact created during the conversation when present.
        let contact_id = match conversation.context.contact_id() {
            Some(id) => {
                info!(contact_id = %id, "reusing conversation contact");
                id.to_string()
            }
            None => {
                let contact = self
                    .crm
                    .create_contact(
                        &account.id,
                        &account.location_id,
                        draft.name.as_deref().unwrap_or("Cliente"),
                        &conversation.phone_number,
                        draft.email.as_deref(),
                        draft.reason.as_deref(),
                        "WhatsApp Bot",
                    )
                    .await
                    .map_err(AppError::from)?;
                conversation.context.set_contact_id(&contact.id);
                contact.id
            }
        };

        let end_local = start_local + Duration::minutes(APPOINTMENT_MINUTES);
        let title = format!("Cita: {}", draft_reason(&draft));

        // Reminder-driven reschedules move the existing appointment
        // instead of creating a second one.
        let appointment_id = match &draft.rescheduling_appointment_id {
            Some(existing) => {
                self.crm
                    .update_appointment(
                        &account.id,
                        existing,
                        &start_local.to_rfc3339(),
                        &end_local.to_rfc3339(),
                        Some(&title),
                    )
                    .await
                    .map_err(AppError::from)?;
                existing.clone()
            }
            None => {
                self.crm
                    .create_appointment(
                        &account.id,
                        &account.calendar_id,
                        &account.location_id,
                        &contact_id,
                        &account.assigned_user_id,
                        &start_local.to_rfc3339(),
                        &end_local.to_rfc3339(),
                        &title,
                    )
                    .await
                    .map_err(AppError::from)?
                    .id
            }
        };

        if let Some(booking_id) = &draft.booking_id {
            self.stores.bookings.link_appointment(booking_id, &appointment_id)?;
            self.stores.bookings.set_contact(booking_id, &contact_id)?;
        }
        if let Some(pid) = payment_id.or(draft.payment_id.as_deref()) {
            if let Err(e) =
                self.stores
                    .payments
                    .update_status(pid, PaymentStatus::Completed, Some(&appointment_id))
            {
                warn!(payment_id = %pid, error = %e, "payment row update failed");
            }
        }

        conversation.context.awaiting_confirmation = false;
        conversation.status = ConversationStatus::Completed;
        conversation.add_message(
            MessageRole::System,
            "Appointment confirmed and created in the CRM",
            HashMap::from([("action".to_string(), serde_json::json!("appointment_confirmed"))]),
        );
        self.stores.conversations.update(&mut conversation)?;

        let (date_str, time_str) = slots::format_spanish(start_local);
        let details = messages::appointment_details(&date_str, &time_str, &draft_reason(&draft));

        self.send_booking_confirmation(
            account,
            &conversation.phone_number,
            draft.name.as_deref().unwrap_or("Cliente"),
            &date_str,
            &time_str,
            &account.name,
            &account.location_id,
            payment_id.is_some() || draft.payment_id.is_some(),
            &details,
        )
        .await;

        info!(%appointment_id, "booking finalized");
        Ok(FinalizeOutcome::Confirmed {
            appointment_id,
            details,
        })
    }

    /// Finalize a directory-channel booking after payment success (or
    /// directly when the tenant takes no payments). Same idempotency and
    /// revalidation contract as the chat path; the webhook uses
    /// `metadata.booking_id` as the canonical key.
    #[instrument(skip(self), fields(%booking_id))]
    pub async fn finalize_directory_booking(&self, booking_id: &str) -> Result<FinalizeOutcome> {
        let tz = self.tz();
        let booking = self
            .stores
            .bookings
            .get(booking_id)?
            .ok_or_else(|| AppError::not_found("Booking", booking_id))?;

        if let Some(appointment_id) = &booking.appointment_id {
            info!(%appointment_id, "booking already finalized, returning existing");
            return Ok(FinalizeOutcome::Confirmed {
                appointment_id: appointment_id.clone(),
                details: self.booking_details(
                    &booking.patient.name,
                    booking.patient.reason.as_deref().unwrap_or("Consulta"),
                    &booking,
                ),
            });
        }

        if booking.payment_required && booking.payment_status != Some(PaymentStatus::Completed) {
            return Ok(FinalizeOutcome::PaymentPending);
        }

        let profile = self.stores.directory.get(&booking.doctor_id)?;
        let account_id = profile
            .as_ref()
            .map(|p| p.account_id.clone())
            .unwrap_or_else(|| booking.doctor_id.clone());
        let account = self
            .stores
            .accounts
            .get(&account_id)?
            .ok_or_else(|| AppError::not_found("Account", &account_id))?;

        let start_local = booking.appointment_at.with_timezone(&tz);

        if slots::slot_taken(&self.crm, &account, tz, start_local).await {
            self.stores
                .bookings
                .set_status(booking_id, BookingStatus::SlotUnavailable)?;
            if let Some(phone) =
                citabot_core::phone::format_for_whatsapp(&booking.patient.phone)
            {
                let _ = self
                    .whatsapp
                    .send_text(&account.phone_number_id, &phone, messages::SLOT_UNAVAILABLE)
                    .await;
            }
            return Ok(FinalizeOutcome::SlotUnavailable);
        }

        let reason = booking.patient.reason.clone().unwrap_or_default();
        let contact = self
            .crm
            .create_contact(
                &account.id,
                &account.location_id,
                &booking.patient.name,
                &booking.patient.phone,
                booking.patient.email.as_deref(),
                Some(&reason),
                "Directory",
            )
            .await
            .map_err(AppError::from)?;

        let end_local = start_local + Duration::minutes(APPOINTMENT_MINUTES);
        let title = format!(
            "Cita: {}",
            booking.patient.reason.as_deref().unwrap_or("Consulta")
        );
        let appointment = self
            .crm
            .create_appointment(
                &account.id,
                &account.calendar_id,
                &account.location_id,
                &contact.id,
                &account.assigned_user_id,
                &start_local.to_rfc3339(),
                &end_local.to_rfc3339(),
                &title,
            )
            .await
            .map_err(AppError::from)?;

        self.stores.bookings.link_appointment(booking_id, &appointment.id)?;
        self.stores.bookings.set_contact(booking_id, &contact.id)?;
        if let Some(pid) = &booking.payment_id {
            if let Err(e) =
                self.stores
                    .payments
                    .update_status(pid, PaymentStatus::Completed, Some(&appointment.id))
            {
                warn!(payment_id = %pid, error = %e, "payment row update failed");
            }
        }

        let doctor_name = booking
            .doctor_name
            .clone()
            .or(profile.as_ref().map(|p| p.full_name.clone()))
            .unwrap_or_else(|| account.name.clone());
        let location = booking
            .location
            .clone()
            .or(profile.and_then(|p| p.office_address))
            .unwrap_or_else(|| "Dirección no disponible".into());
        let details = messages::appointment_details(
            &booking.appointment_date,
            &booking.appointment_time,
            booking.patient.reason.as_deref().unwrap_or("Consulta"),
        );

        self.send_booking_confirmation(
            &account,
            &booking.patient.phone,
            &booking.patient.name,
            &booking.appointment_date,
            &booking.appointment_time,
            &doctor_name,
            &location,
            booking.payment_required,
            &details,
        )
        .await;

        info!(appointment_id = %appointment.id, "directory booking finalized");
        Ok(FinalizeOutcome::Confirmed {
            appointment_id: appointment.id,
            details,
        })
    }

    /// Send the confirmation: the pre-approved template first, plain text
    /// when the template send fails. Never fails the booking.
    #[allow(clippy::too_many_arguments)]
    async fn send_booking_confirmation(
        &self,
        account: &Account,
        to_phone: &str,
        patient_name: &str,
        date_str: &str,
        time_str: &str,
        doctor_name: &str,
        location: &str,
        paid: bool,
        details: &str,
    ) {
        let Some(to) = citabot_core::phone::format_for_whatsapp(to_phone) else {
            warn!(phone = %to_phone, "unusable phone for confirmation send");
            return;
        };

        let template = templates::confirmation_template(
            &to,
            patient_name,
            date_str,
            time_str,
            doctor_name,
            location,
        );
        if self
            .whatsapp
            .send_template(&account.phone_number_id, template)
            .await
            .is_some()
        {
            return;
        }

        // Template rejected (unapproved, locale mismatch…): plain text.
        let fallback = if paid {
            messages::payment_received(details)
        } else {
            messages::booking_confirmed(details)
        };
        if let Err(e) = self
            .whatsapp
            .send_text(&account.phone_number_id, &to, &fallback)
            .await
        {
            warn!(error = %e, "confirmation fallback send failed");
        }
    }

    fn booking_details(&self, _patient: &str, reason: &str, booking: &Booking) -> String {
        messages::appointment_details(&booking.appointment_date, &booking.appointment_time, reason)
    }
}

fn draft_reason(draft: &citabot_store::types::AppointmentDraft) -> String {
    draft.reason.clone().unwrap_or_else(|| "Consulta".into())
}
