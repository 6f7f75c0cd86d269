//! Reminder reply routing: inbound messages from a phone with a live
//! reminder context go to confirm/reschedule/cancel handling instead of
//! the booking engine.

use std::collections::HashMap;

use citabot_core::Result;
use citabot_store::types::{
    ActiveReminderContext, Account, AppointmentDraft, Conversation, MessageRole,
};
use citabot_whatsapp::types::{ButtonReply, InboundMessage};
use citabot_whatsapp::templates;
use tracing::{info, instrument, warn};

use crate::engine::Engine;

const CONFIRM_KEYWORDS: [&str; 6] = ["si", "sí", "confirmar", "confirm", "ok", "perfecto"];
const CANCEL_KEYWORDS: [&str; 4] = ["cancelar", "cancel", "no", "cancela"];
const RESCHEDULE_KEYWORDS: [&str; 6] =
    ["cambiar", "reprogramar", "mover", "reschedule", "otra hora", "otro dia"];

/// What a reminder reply asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderAction {
    Confirm,
    Cancel,
    Reschedule,
    /// Nothing recognizable: offer the three buttons.
    Unclear,
}

/// Keyword classification for free-text reminder replies. Cancel wins over
/// reschedule wins over confirm, mirroring the order the keywords are
/// checked in.
pub fn classify_reply(text: &str) -> ReminderAction {
    let lower = text.trim().to_lowercase();
    let word_match = |keyword: &str| {
        if keyword.contains(' ') {
            lower.contains(keyword)
        } else {
            lower
                .split(|c: char| !c.is_alphanumeric() && c != 'é' && c != 'í' && c != 'ó')
                .any(|w| w == keyword)
        }
    };

    if CANCEL_KEYWORDS.iter().any(|k| word_match(k)) {
        return ReminderAction::Cancel;
    }
    if RESCHEDULE_KEYWORDS.iter().any(|k| word_match(k)) {
        return ReminderAction::Reschedule;
    }
    if CONFIRM_KEYWORDS.iter().any(|k| word_match(k)) {
        return ReminderAction::Confirm;
    }
    ReminderAction::Unclear
}

impl Engine {
    /// Free-text message from a phone with an active reminder context.
    #[instrument(skip_all, fields(appointment_id = %context.appointment_id))]
    pub(crate) async fn handle_reminder_text(
        &self,
        account: &Account,
        msg: &InboundMessage,
        context: &ActiveReminderContext,
        conversation: &mut Conversation,
    ) -> Result<()> {
        let text = msg.text.as_deref().unwrap_or_default();
        match classify_reply(text) {
            ReminderAction::Cancel => {
                self.reminder_cancel(account, context, conversation).await
            }
            ReminderAction::Reschedule => {
                self.reminder_reschedule(account, context, conversation).await
            }
            ReminderAction::Confirm => {
                self.reminder_confirm(account, context, conversation).await
            }
            ReminderAction::Unclear => {
                self.send_reminder_options(account, conversation).await
            }
        }
    }

    /// Button tap on a reminder message (`reminder_*` ids). Without a live
    /// context the reminder has expired; answer gracefully.
    #[instrument(skip_all, fields(%button_id))]
    pub(crate) async fn handle_reminder_button(
        &self,
        account: &Account,
        msg: &InboundMessage,
        button_id: &str,
    ) -> Result<()> {
        let Some(context) = self.stores.reminders.active_context(&msg.from_number)? else {
            warn!(phone = %msg.from_number, "reminder button without active context");
            return self
                .send_text_response(account, &msg.from_number, templates::expired_reminder(), None)
                .await;
        };

        let mut conversation = self
            .stores
            .conversations
            .get_or_create(&account.id, &msg.from_number)?;

        match button_id {
            "reminder_confirm" => {
                self.reminder_confirm(account, &context, &mut conversation).await
            }
            "reminder_cancel" => {
                self.reminder_cancel(account, &context, &mut conversation).await
            }
            "reminder_reschedule" => {
                self.reminder_reschedule(account, &context, &mut conversation)
                    .await
            }
            other => {
                warn!(button_id = %other, "unknown reminder button");
                Ok(())
            }
        }
    }

    /// Confirm attendance: thank the patient and close the context.
    async fn reminder_confirm(
        &self,
        account: &Account,
        context: &ActiveReminderContext,
        conversation: &mut Conversation,
    ) -> Result<()> {
        self.send_text_response(
            account,
            &conversation.phone_number.clone(),
            templates::confirmation_thanks(),
            Some(conversation),
        )
        .await?;
        self.stores.reminders.clear_context(&context.id)?;
        info!(appointment_id = %context.appointment_id, "reminder confirmed");
        Ok(())
    }

    /// Cancel the CRM appointment; contexts clear only on success.
    async fn reminder_cancel(
        &self,
        account: &Account,
        context: &ActiveReminderContext,
        conversation: &mut Conversation,
    ) -> Result<()> {
        let cancelled = self
            .crm
            .cancel_appointment(&account.id, &context.appointment_id)
            .await
            .unwrap_or(false);

        let reply = if cancelled {
            templates::cancellation_confirmed()
        } else {
            templates::cancellation_failed()
        };
        self.send_text_response(
            account,
            &conversation.phone_number.clone(),
            reply,
            Some(conversation),
        )
        .await?;

        if cancelled {
            self.stores
                .reminders
                .clear_contexts_for_phone(&conversation.phone_number)?;
            info!(appointment_id = %context.appointment_id, "appointment cancelled from reminder");
        }
        Ok(())
    }

    /// Enter the rescheduling sub-mode: remember which appointment moves,
    /// then let the engine's normal extraction pick up the new date/time
    /// from free text.
    async fn reminder_reschedule(
        &self,
        account: &Account,
        context: &ActiveReminderContext,
        conversation: &mut Conversation,
    ) -> Result<()> {
        let appointment = self
            .crm
            .get_appointment(&account.id, &context.appointment_id)
            .await
            .ok()
            .flatten();

        if appointment.is_none() {
            return self
                .send_text_response(
                    account,
                    &conversation.phone_number.clone(),
                    templates::reschedule_lookup_failed(),
                    Some(conversation),
                )
                .await;
        }

        let mut draft = conversation
            .context
            .appointment
            .clone()
            .unwrap_or(AppointmentDraft::default());
        draft.rescheduling_appointment_id = Some(context.appointment_id.clone());
        conversation.context.appointment = Some(draft);
        conversation.context.awaiting_confirmation = false;
        self.stores.conversations.update(conversation)?;

        self.send_text_response(
            account,
            &conversation.phone_number.clone(),
            templates::reschedule_prompt(),
            Some(conversation),
        )
        .await
    }

    /// Unrecognized reply: the three-button prompt.
    async fn send_reminder_options(
        &self,
        account: &Account,
        conversation: &mut Conversation,
    ) -> Result<()> {
        self.whatsapp
            .send_interactive(
                &account.phone_number_id,
                &conversation.phone_number,
                templates::reminder_options_body(),
                vec![
                    ButtonReply::new("reminder_confirm", "✅ Confirmar"),
                    ButtonReply::new("reminder_reschedule", "📅 Reprogramar"),
                    ButtonReply::new("reminder_cancel", "❌ Cancelar"),
                ],
                Some("Llegue 10 minutos antes"),
            )
            .await
            .map_err(citabot_core::AppError::from)?;

        conversation.add_message(
            MessageRole::Assistant,
            "Opciones de cita enviadas",
            HashMap::from([("type".to_string(), serde_json::json!("reminder_options"))]),
        );
        self.stores.conversations.update(conversation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_keywords_classify() {
        for text in ["si", "Sí", "ok", "perfecto, confirmar", "confirm"] {
            assert_eq!(classify_reply(text), ReminderAction::Confirm, "{text}");
        }
    }

    #[test]
    fn cancel_beats_other_categories() {
        assert_eq!(classify_reply("no"), ReminderAction::Cancel);
        assert_eq!(classify_reply("cancelar por favor"), ReminderAction::Cancel);
        // "no" appears alongside a reschedule word: cancel checked first.
        assert_eq!(classify_reply("no, mejor cambiar"), ReminderAction::Cancel);
    }

    #[test]
    fn reschedule_keywords_classify() {
        for text in ["cambiar", "quiero reprogramar", "otra hora", "otro dia"] {
            assert_eq!(classify_reply(text), ReminderAction::Reschedule, "{text}");
        }
    }

    #[test]
    fn unclear_text_offers_options() {
        assert_eq!(classify_reply("¿dónde es la cita?"), ReminderAction::Unclear);
        assert_eq!(classify_reply(""), ReminderAction::Unclear);
        // Word-boundary check: "nos" contains "no" but is not a cancel.
        assert_eq!(classify_reply("nos vemos"), ReminderAction::Unclear);
    }
}
