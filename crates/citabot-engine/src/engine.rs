//! Per-turn conversation processing: LLM turn generation, structured
//! extraction, slot probing, and the confirmation sub-state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use citabot_agent::extract::Extractor;
use citabot_agent::prompts;
use citabot_agent::provider::{ChatMessage, LlmProvider, Role};
use citabot_core::config::CitabotConfig;
use citabot_core::{AppError, Result};
use citabot_crm::CrmClient;
use citabot_payments::PaymentsClient;
use citabot_store::types::{
    Account, AvailabilityBlock, AppointmentDraft, BookingSource, Conversation, MessageRole,
    PatientInfo,
};
use citabot_store::Stores;
use citabot_whatsapp::types::{ButtonReply, InboundMessage, MessageType};
use citabot_whatsapp::WhatsAppClient;
use tracing::{info, instrument, warn};

use crate::messages;
use crate::pipeline::FinalizeOutcome;
use crate::slots;
use crate::{gate, slots::Availability};

/// Keywords that cancel a pending confirmation from free text.
const CANCEL_KEYWORDS: [&str; 8] = [
    "no",
    "cancelar",
    "cancel",
    "cancela",
    "no quiero",
    "dejalo",
    "déjalo",
    "olvidalo",
];

/// Everything the message flows need, shared behind `Arc` by the gateway.
pub struct Engine {
    pub config: Arc<CitabotConfig>,
    pub stores: Stores,
    pub crm: CrmClient,
    pub whatsapp: WhatsAppClient,
    pub payments: PaymentsClient,
    pub llm: Arc<dyn LlmProvider>,
}

impl Engine {
    pub fn tz(&self) -> Tz {
        self.config.tz()
    }

    /// Entry point for every parsed inbound chat message:
    /// tenant lookup → dedup → active check → subscription gate → dispatch.
    #[instrument(skip(self, msg), fields(message_id = %msg.message_id, from = %msg.from_number))]
    pub async fn handle_inbound(&self, msg: &InboundMessage) -> Result<()> {
        let Some(account) = self
            .stores
            .accounts
            .get_by_phone_number_id(&msg.phone_number_id)?
        else {
            warn!(phone_number_id = %msg.phone_number_id, "no account for phone_number_id");
            return Ok(());
        };

        if self.config.dedup.enabled
            && !self
                .stores
                .dedup
                .claim(&account.id, &msg.message_id, &msg.from_number)
        {
            return Ok(());
        }

        if !account.is_active() {
            warn!(account_id = %account.id, "account is not active");
            return Ok(());
        }

        let decision = gate::check_access(
            self.config.subscription.enforcement_enabled,
            &account,
            Utc::now(),
        );
        if !decision.allowed {
            warn!(account_id = %account.id, reason = decision.reason, "subscription access denied");
            // One plain message; no conversation is created or updated.
            let _ = self
                .whatsapp
                .send_text(
                    &account.phone_number_id,
                    &msg.from_number,
                    messages::SUBSCRIPTION_REQUIRED,
                )
                .await;
            return Ok(());
        }

        match msg.message_type {
            MessageType::Text => self.handle_text(&account, msg).await,
            MessageType::Interactive => self.handle_interactive(&account, msg).await,
            other => {
                info!(?other, "unsupported message type, ignoring");
                Ok(())
            }
        }
    }

    // ── Text flow ─────────────────────────────────────────────────────────

    async fn handle_text(&self, account: &Account, msg: &InboundMessage) -> Result<()> {
        let text = msg.text.clone().unwrap_or_default();
        let mut conversation = self
            .stores
            .conversations
            .get_or_create(&account.id, &msg.from_number)?;

        // A live reminder context redirects the message away from the
        // booking engine entirely.
        if let Some(context) = self.stores.reminders.active_context(&msg.from_number)? {
            return self
                .handle_reminder_text(account, msg, &context, &mut conversation)
                .await;
        }

        let mut metadata = HashMap::new();
        metadata.insert("message_id".to_string(), serde_json::json!(msg.message_id));
        conversation.add_message(MessageRole::User, text.clone(), metadata);
        self.stores.conversations.update(&mut conversation)?;

        if conversation.context.awaiting_confirmation {
            let offered_alternatives = conversation
                .context
                .appointment
                .as_ref()
                .and_then(|d| d.availability.as_ref())
                .map(|a| !a.exact_match && !a.alternatives.is_empty())
                .unwrap_or(false);

            if offered_alternatives {
                return self
                    .handle_alternative_selection(account, &mut conversation, &text)
                    .await;
            }

            if is_cancel_message(&text) {
                self.cancel_draft(&mut conversation)?;
                return self
                    .send_text_response(
                        account,
                        &msg.from_number,
                        messages::CANCELLED_BY_USER,
                        Some(&mut conversation),
                    )
                    .await;
            }

            // The user typed a new date/time instead of tapping a button:
            // drop the flag and re-run extraction over the new text.
            conversation.context.awaiting_confirmation = false;
            self.stores.conversations.update(&mut conversation)?;
        }

        self.process_turn(account, &mut conversation, msg.contact_name.as_deref())
            .await
    }

    /// Full turn: LLM reply, name pass, intent pass, slot probe, booking
    /// draft, confirmation send.
    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    async fn process_turn(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        profile_name: Option<&str>,
    ) -> Result<()> {
        let tz = self.tz();
        let now = Utc::now();

        let llm_messages: Vec<ChatMessage> = conversation
            .messages_for_llm()
            .into_iter()
            .map(|(role, content)| ChatMessage {
                role: match role {
                    MessageRole::User => Role::User,
                    MessageRole::Assistant => Role::Assistant,
                    MessageRole::System => Role::System,
                },
                content: content.to_string(),
            })
            .collect();

        let system = prompts::conversation_prompt(
            tz,
            now,
            account.custom_prompt.as_deref(),
            Some(&format!("Negocio: {}", account.name)),
        );

        let reply = match self.llm.chat(&system, &llm_messages).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "turn generation failed");
                return self
                    .send_text_response(
                        account,
                        &conversation.phone_number.clone(),
                        messages::GENERIC_ERROR,
                        Some(conversation),
                    )
                    .await;
            }
        };

        let transcript = flatten_for_extraction(&llm_messages);
        let extractor = Extractor::new(self.llm.as_ref());

        // Name pass: create the contact as soon as a name surfaces, before
        // the intent is complete.
        let extracted_name = extractor.extract_name(&transcript).await;
        let contact_name = extracted_name.as_deref().or(profile_name);
        if let Some(name) = contact_name {
            self.ensure_contact(account, conversation, name, None, None)
                .await;
        }

        let intent = extractor
            .extract_intent(
                &transcript,
                account.custom_prompt.as_deref(),
                contact_name,
                tz,
                now,
            )
            .await;

        let Some(intent) = intent else {
            return self
                .send_text_response(
                    account,
                    &conversation.phone_number.clone(),
                    &reply,
                    Some(conversation),
                )
                .await;
        };

        // Email or reason surfacing updates the contact profile.
        if intent.email.is_some() || !intent.reason.is_empty() {
            let (name, email, reason) =
                (intent.name.clone(), intent.email.clone(), intent.reason.clone());
            self.ensure_contact(account, conversation, &name, email.as_deref(), Some(&reason))
                .await;
        }

        let availability = slots::check(&self.crm, account, tz, intent.datetime).await;
        let block = availability.to_block();

        let (display_date, display_time) = slots::format_spanish(intent.datetime);
        let payment_required = account.payments_functional();

        let booking = self.stores.bookings.create(citabot_store::bookings::NewBooking {
            doctor_id: account.id.clone(),
            patient: PatientInfo {
                name: intent.name.clone(),
                phone: conversation.phone_number.clone(),
                email: intent.email.clone(),
                reason: Some(intent.reason.clone()),
            },
            appointment_at: intent.datetime.with_timezone(&Utc),
            appointment_date: display_date.clone(),
            appointment_time: display_time.clone(),
            source: BookingSource::Chat,
            payment_required,
            calendar_id: Some(account.calendar_id.clone()),
            doctor_name: Some(account.name.clone()),
            location: Some(account.location_id.clone()),
            specialty: None,
            consultation_price: payment_required.then_some(account.payments.appointment_price),
            metadata: HashMap::from([
                ("reason".to_string(), serde_json::json!(intent.reason)),
                (
                    "conversation_id".to_string(),
                    serde_json::json!(conversation.id),
                ),
            ]),
        })?;

        let rescheduling = conversation
            .context
            .appointment
            .as_ref()
            .and_then(|d| d.rescheduling_appointment_id.clone());

        let draft = AppointmentDraft {
            name: Some(intent.name.clone()),
            reason: Some(intent.reason.clone()),
            datetime: Some(intent.datetime_iso.clone()),
            raw_datetime: intent.raw_datetime.clone(),
            email: intent.email.clone(),
            notes: intent.notes.clone(),
            booking_id: Some(booking.id.clone()),
            payment_id: None,
            payment_status: None,
            availability: Some(block.clone()),
            rescheduling_appointment_id: rescheduling,
        };

        if conversation.context.user_name.is_none() {
            conversation.context.user_name = Some(intent.name.clone());
        }
        conversation.context.appointment = Some(draft.clone());
        conversation.context.awaiting_confirmation = true;
        conversation.context.confirmation_sent_at = Some(Utc::now());
        self.stores.conversations.update(conversation)?;

        let message = messages::confirmation_message(&draft, &block, &display_date, &display_time);
        self.send_confirmation(account, conversation, &message, &availability)
            .await
    }

    /// The user answered a numbered alternatives list.
    async fn handle_alternative_selection(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        selection: &str,
    ) -> Result<()> {
        let phone = conversation.phone_number.clone();
        let Some(mut draft) = conversation.context.appointment.clone() else {
            return self
                .send_text_response(
                    account,
                    &phone,
                    messages::NO_APPOINTMENT_INFO,
                    Some(conversation),
                )
                .await;
        };
        let alternatives = draft
            .availability
            .as_ref()
            .map(|a| a.alternatives.clone())
            .unwrap_or_default();

        let normalized = selection.trim().to_lowercase();
        if matches!(normalized.as_str(), "no" | "cancelar" | "cancel") {
            self.cancel_draft(conversation)?;
            return self
                .send_text_response(
                    account,
                    &phone,
                    messages::CANCELLED_BY_USER,
                    Some(conversation),
                )
                .await;
        }

        match normalized.parse::<usize>() {
            Ok(index) if (1..=alternatives.len()).contains(&index) => {
                let slot = &alternatives[index - 1];
                info!(slot = %slot.datetime, index, "alternative slot selected");

                draft.datetime = Some(slot.datetime.clone());
                // The user picked this specific slot, so it now counts as
                // an exact match with no further alternatives.
                draft.availability = Some(AvailabilityBlock {
                    available: true,
                    exact_match: true,
                    slots_for_date: true,
                    alternatives: Vec::new(),
                    error: None,
                    message: None,
                });

                conversation.context.appointment = Some(draft.clone());
                conversation.context.awaiting_confirmation = true;
                conversation.context.confirmation_sent_at = Some(Utc::now());
                self.stores.conversations.update(conversation)?;

                let block = draft.availability.clone().unwrap_or_default();
                let message = messages::confirmation_message(
                    &draft,
                    &block,
                    &slot.display_date,
                    &slot.display_time,
                );
                self.send_confirmation(
                    account,
                    conversation,
                    &message,
                    &Availability::Exact {
                        alternatives: Vec::new(),
                    },
                )
                .await
            }
            _ => {
                self.send_text_response(
                    account,
                    &phone,
                    &messages::selection_out_of_range(alternatives.len()),
                    Some(conversation),
                )
                .await
            }
        }
    }

    // ── Interactive flow ──────────────────────────────────────────────────

    async fn handle_interactive(&self, account: &Account, msg: &InboundMessage) -> Result<()> {
        let button_id = msg.button_id().map(String::from);

        // Reminder buttons route before any confirmation-state checks.
        if let Some(id) = button_id.as_deref() {
            if id.starts_with("reminder_") {
                return self.handle_reminder_button(account, msg, id).await;
            }
        }

        let mut conversation = self
            .stores
            .conversations
            .get_or_create(&account.id, &msg.from_number)?;

        if !conversation.context.awaiting_confirmation {
            warn!(conversation_id = %conversation.id, "button tap without pending confirmation");
            return Ok(());
        }

        let response = match button_id.as_deref() {
            Some("confirm_yes") => self.handle_confirm_yes(account, &mut conversation).await?,
            Some("confirm_no") => {
                self.cancel_draft(&mut conversation)?;
                Some(messages::DECLINED_CONFIRMATION.to_string())
            }
            other => {
                warn!(button_id = ?other, "unknown button id");
                return Ok(());
            }
        };

        match response {
            Some(text) => {
                self.send_text_response(account, &msg.from_number, &text, Some(&mut conversation))
                    .await
            }
            // Finalization already answered the patient.
            None => Ok(()),
        }
    }

    /// ✓ pressed: payments-enabled tenants get a checkout link (with the
    /// distinct misconfiguration messages), others book directly. Returns
    /// `None` when finalization already answered the patient.
    async fn handle_confirm_yes(
        &self,
        account: &Account,
        conversation: &mut Conversation,
    ) -> Result<Option<String>> {
        if account.payments_functional() {
            if account.payments.connected_account_id.is_none() {
                return Ok(Some(messages::PAYMENTS_NO_ACCOUNT.to_string()));
            }
            if !account.payments.onboarding_completed {
                return Ok(Some(messages::PAYMENTS_ONBOARDING_INCOMPLETE.to_string()));
            }
            if !account.payments.charges_enabled {
                return Ok(Some(messages::PAYMENTS_CHARGES_DISABLED.to_string()));
            }

            return match self
                .create_payment_for_conversation(account, conversation)
                .await
            {
                Ok(link) => Ok(Some(messages::payment_link_message(
                    link.amount,
                    &link.currency,
                    &link.url,
                ))),
                Err(e) => {
                    warn!(error = %e, "checkout session creation failed");
                    Ok(Some(messages::PAYMENT_LINK_FAILED.to_string()))
                }
            };
        }

        match self
            .finalize_from_conversation(account, &conversation.id.clone(), None)
            .await
        {
            Ok(FinalizeOutcome::Confirmed { .. }) => {
                // Finalization sent the confirmation (template or
                // fallback); reload so later turns see the completed state.
                if let Some(updated) = self.stores.conversations.get(&conversation.id)? {
                    *conversation = updated;
                }
                Ok(None)
            }
            // The slot-unavailable message was already sent by the
            // pipeline; nothing more to say here.
            Ok(FinalizeOutcome::SlotUnavailable) => Ok(None),
            Ok(FinalizeOutcome::PaymentPending) => Ok(Some(messages::PAYMENT_LINK_FAILED.to_string())),
            Err(e) => {
                warn!(error = %e, "direct booking failed");
                Ok(Some(messages::BOOKING_FAILED.to_string()))
            }
        }
    }

    // ── Shared helpers ────────────────────────────────────────────────────

    /// Create the CRM contact once per conversation (id cached in the
    /// context metadata); afterwards push profile updates to it.
    pub(crate) async fn ensure_contact(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        name: &str,
        email: Option<&str>,
        reason: Option<&str>,
    ) {
        let existing = conversation.context.contact_id().map(String::from);
        match existing {
            Some(contact_id) => {
                if let Err(e) = self
                    .crm
                    .update_contact(&account.id, &contact_id, Some(name), email, reason)
                    .await
                {
                    warn!(%contact_id, error = %e, "contact update failed");
                }
            }
            None => {
                match self
                    .crm
                    .create_contact(
                        &account.id,
                        &account.location_id,
                        name,
                        &conversation.phone_number,
                        email,
                        reason,
                        "WhatsApp Bot",
                    )
                    .await
                {
                    Ok(contact) => {
                        conversation.context.set_contact_id(&contact.id);
                        if let Err(e) = self.stores.conversations.update(conversation) {
                            warn!(error = %e, "failed to persist contact id");
                        }
                    }
                    Err(e) => warn!(error = %e, "contact creation failed"),
                }
            }
        }
    }

    pub(crate) fn cancel_draft(&self, conversation: &mut Conversation) -> Result<()> {
        conversation.context.appointment = None;
        conversation.context.awaiting_confirmation = false;
        conversation.context.confirmation_sent_at = None;
        conversation.add_message(
            MessageRole::System,
            "Appointment draft cancelled by user",
            HashMap::from([("action".to_string(), serde_json::json!("appointment_cancelled"))]),
        );
        self.stores.conversations.update(conversation)?;
        Ok(())
    }

    /// Send a plain text reply and record it as an assistant message.
    pub(crate) async fn send_text_response(
        &self,
        account: &Account,
        to: &str,
        text: &str,
        conversation: Option<&mut Conversation>,
    ) -> Result<()> {
        self.whatsapp
            .send_text(&account.phone_number_id, to, text)
            .await
            .map_err(AppError::from)?;

        if let Some(conversation) = conversation {
            conversation.add_message(MessageRole::Assistant, text, HashMap::new());
            self.stores.conversations.update(conversation)?;
        }
        Ok(())
    }

    /// Exact matches get ✓/✗ buttons; anything else goes as plain text so
    /// the user answers with an index.
    async fn send_confirmation(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        text: &str,
        availability: &Availability,
    ) -> Result<()> {
        match availability {
            Availability::Exact { .. } => {
                self.whatsapp
                    .send_interactive(
                        &account.phone_number_id,
                        &conversation.phone_number,
                        text,
                        vec![
                            ButtonReply::new("confirm_yes", "✅ Sí, confirmar"),
                            ButtonReply::new("confirm_no", "❌ No, cancelar"),
                        ],
                        Some("Por favor confirma tu cita"),
                    )
                    .await
                    .map_err(AppError::from)?;
            }
            _ => {
                self.whatsapp
                    .send_text(&account.phone_number_id, &conversation.phone_number, text)
                    .await
                    .map_err(AppError::from)?;
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), serde_json::json!("confirmation"));
        conversation.add_message(MessageRole::Assistant, text, metadata);
        self.stores.conversations.update(conversation)?;
        Ok(())
    }
}

/// Whole-word cancel detection. Single-word keywords must appear as a
/// standalone word ("no" must not match "conozco"); phrases match as
/// substrings.
pub fn is_cancel_message(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    for keyword in CANCEL_KEYWORDS {
        if keyword.contains(' ') {
            if lower.contains(keyword) {
                return true;
            }
        } else if lower
            .split(|c: char| !c.is_alphanumeric() && c != 'é' && c != 'í' && c != 'ó')
            .any(|word| word == keyword)
        {
            return true;
        }
    }
    false
}

/// Flatten the history into the `Usuario:`/`Asistente:` transcript the
/// extractor prompts expect.
pub fn flatten_for_extraction(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let speaker = match m.role {
                Role::User => "Usuario",
                _ => "Asistente",
            };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_detection_matches_whole_words() {
        assert!(is_cancel_message("no"));
        assert!(is_cancel_message("No, gracias"));
        assert!(is_cancel_message("cancelar"));
        assert!(is_cancel_message("mejor cancela la cita"));
        assert!(is_cancel_message("no quiero la cita"));
        assert!(is_cancel_message("olvidalo"));
    }

    #[test]
    fn cancel_detection_ignores_substrings() {
        assert!(!is_cancel_message("conozco al doctor"));
        assert!(!is_cancel_message("quiero una cita mañana"));
        assert!(!is_cancel_message("nos vemos el lunes"));
    }

    #[test]
    fn transcript_flattening_labels_speakers() {
        let messages = vec![
            ChatMessage::user("Hola, soy Juan"),
            ChatMessage::assistant("¡Hola Juan! ¿En qué puedo ayudarte?"),
            ChatMessage::user("quiero una cita mañana a las 10"),
        ];
        let transcript = flatten_for_extraction(&messages);
        assert_eq!(
            transcript,
            "Usuario: Hola, soy Juan\n\
             Asistente: ¡Hola Juan! ¿En qué puedo ayudarte?\n\
             Usuario: quiero una cita mañana a las 10"
        );
    }
}
