//! User-visible Spanish texts and the confirmation message builder.

use citabot_store::types::{AppointmentDraft, AvailabilityBlock};

pub const AUTH_FAILED_MESSAGE: &str = "Lo siento, hay un problema con la conexión al sistema de \
     citas. Por favor, contacta al administrador para resolver este problema.";

pub const GENERIC_ERROR: &str =
    "Lo siento, hubo un error procesando tu mensaje. Por favor intenta nuevamente.";

pub const SLOT_UNAVAILABLE: &str = "Lo sentimos, el horario seleccionado ya no está disponible. \
     Te contactaremos para reprogramar tu cita.";

pub const SLOT_UNAVAILABLE_BEFORE_PAYMENT: &str = "Lo sentimos, ese horario ya no está \
     disponible. Por favor selecciona otro horario.";

pub const CANCELLED_BY_USER: &str = "Entiendo, he cancelado el proceso de agendamiento. \
     ¿Hay algo más en lo que pueda ayudarte?";

pub const DECLINED_CONFIRMATION: &str = "Entiendo, no hay problema. La cita no ha sido agendada.\n\
     Si deseas agendar en otro momento, estaré aquí para ayudarte.";

pub const SUBSCRIPTION_REQUIRED: &str = "⚠️ Lo sentimos, su cuenta no tiene una suscripción activa.\n\n\
     Para continuar utilizando nuestro servicio de citas por WhatsApp, necesita activar su \
     suscripción.\n\nPor favor, contacte a su administrador o visite nuestro portal para más \
     información.";

pub const PAYMENTS_NO_ACCOUNT: &str = "❌ La cuenta de pagos no está configurada.\n\n\
     Por favor contacta al administrador para completar la configuración de pagos.";

pub const PAYMENTS_ONBOARDING_INCOMPLETE: &str = "❌ La configuración de pagos está incompleta.\n\n\
     El proceso de verificación aún no ha sido completado. Por favor contacta al administrador \
     para finalizar la configuración.";

pub const PAYMENTS_CHARGES_DISABLED: &str = "❌ Los pagos no están habilitados en este momento.\n\n\
     La cuenta de pagos está en proceso de activación. Por favor intenta más tarde o contacta \
     al administrador.";

pub const PAYMENT_LINK_FAILED: &str = "❌ Lo siento, hubo un problema al generar el enlace de pago.\n\
     Por favor, intenta nuevamente más tarde o contacta directamente.";

pub const BOOKING_FAILED: &str = "❌ Lo siento, hubo un problema al agendar tu cita.\n\
     Por favor, intenta nuevamente más tarde o contacta directamente.";

pub const NO_APPOINTMENT_INFO: &str =
    "No se encontró información de cita para procesar tu selección.";

pub fn payment_link_message(amount_minor: i64, currency: &str, url: &str) -> String {
    format!(
        "📋 ¡Perfecto! He registrado tu cita.\n\n\
         💳 Para confirmarla, necesitas realizar el pago de ${:.2} {}.\n\n\
         🔗 Por favor realiza el pago aquí:\n{url}\n\n\
         ⏱️ Este enlace expirará en 30 minutos.\n\
         Una vez confirmado el pago, tu cita quedará agendada.",
        amount_minor as f64 / 100.0,
        currency.to_uppercase(),
    )
}

pub fn booking_confirmed(details: &str) -> String {
    format!(
        "✅ ¡Excelente! Tu cita ha sido agendada exitosamente.\n\n\
         📅 {details}\n\n\
         Te esperamos. ¡Que tengas un excelente día!"
    )
}

pub fn payment_received(details: &str) -> String {
    format!(
        "✅ ¡Pago recibido! Tu cita ha sido confirmada.\n\n\
         📅 {details}\n\n\
         Recibirás un recordatorio el día de tu cita.\n\
         ¡Gracias por tu preferencia!"
    )
}

pub fn selection_out_of_range(count: usize) -> String {
    format!(
        "Por favor selecciona un número entre 1 y {count}, o escribe 'no' para cancelar."
    )
}

pub fn appointment_details(date: &str, time: &str, reason: &str) -> String {
    format!("Fecha: {date}\nHora: {time}\nMotivo: {reason}")
}

/// Build the confirmation message for a draft plus availability outcome.
/// Exact matches get the ✓/✗ button framing; alternatives get a numbered
/// list the user answers by index.
pub fn confirmation_message(
    draft: &AppointmentDraft,
    availability: &AvailabilityBlock,
    display_date: &str,
    display_time: &str,
) -> String {
    if availability.error.as_deref() == Some("authentication_failed") {
        return availability
            .message
            .clone()
            .unwrap_or_else(|| AUTH_FAILED_MESSAGE.to_string());
    }

    let name = draft.name.as_deref().unwrap_or("Cliente");
    let reason = draft.reason.as_deref().unwrap_or("Consulta");

    if availability.available && availability.exact_match {
        let mut message = format!(
            "📋 *Confirma tu cita:*\n\n\
             👤 *Nombre:* {name}\n\
             📝 *Motivo:* {reason}\n\
             📅 *Fecha:* {display_date}\n\
             🕐 *Hora:* {display_time}\n"
        );
        if let Some(notes) = &draft.notes {
            message.push_str(&format!("📌 *Notas:* {notes}\n"));
        }
        message.push_str("\n¿Deseas confirmar esta cita?");
        return message;
    }

    if !availability.alternatives.is_empty() {
        let mut message = if availability.available && availability.slots_for_date {
            format!(
                "⚠️ *La hora exacta solicitada no está disponible*\n\n\
                 👤 *Nombre:* {name}\n\
                 📝 *Motivo:* {reason}\n\
                 📅 *Fecha solicitada:* {display_date}\n\
                 🕐 *Hora solicitada:* {display_time}\n\n\
                 ⏰ *Horarios disponibles para {display_date}:*\n"
            )
        } else {
            format!(
                "❌ *No hay horarios disponibles para esa fecha*\n\n\
                 👤 *Nombre:* {name}\n\
                 📝 *Motivo:* {reason}\n\
                 📅 *Fecha solicitada:* {display_date}\n\
                 🕐 *Hora solicitada:* {display_time}\n\n\
                 🔄 *Próximos horarios disponibles:*\n"
            )
        };

        for (i, alt) in availability.alternatives.iter().enumerate() {
            message.push_str(&format!(
                "\n{}. 📅 {} - 🕐 {}",
                i + 1,
                alt.display_date,
                alt.display_time
            ));
        }
        message.push_str(
            "\n\n💡 ¿Te gustaría agendar en alguno de estos horarios?\n\
             Responde con el número de tu preferencia o escribe 'no' para cancelar.",
        );
        return message;
    }

    format!(
        "❌ *Lo siento, no hay horarios disponibles*\n\n\
         👤 *Nombre:* {name}\n\
         📝 *Motivo:* {reason}\n\
         📅 *Fecha solicitada:* {display_date}\n\
         🕐 *Hora solicitada:* {display_time}\n\n\
         ❌ No hay horarios disponibles en los próximos días.\n\
         Por favor contacta directamente al consultorio para verificar disponibilidad."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use citabot_store::types::SlotOption;

    fn draft() -> AppointmentDraft {
        AppointmentDraft {
            name: Some("Juan Pérez".into()),
            reason: Some("dolor de espalda".into()),
            datetime: Some("2025-06-09T10:00:00-06:00".into()),
            ..Default::default()
        }
    }

    fn alternatives(n: usize) -> Vec<SlotOption> {
        (0..n)
            .map(|i| SlotOption {
                datetime: format!("2025-06-09T1{i}:00:00-06:00"),
                display_date: "9 de junio de 2025".into(),
                display_time: format!("0{i}:00 PM"),
                date: "2025-06-09".into(),
                time: format!("1{i}:00"),
            })
            .collect()
    }

    #[test]
    fn exact_match_message_asks_for_confirmation() {
        let block = AvailabilityBlock {
            available: true,
            exact_match: true,
            slots_for_date: true,
            ..Default::default()
        };
        let msg = confirmation_message(&draft(), &block, "9 de junio de 2025", "10:00 AM");
        assert!(msg.contains("Confirma tu cita"));
        assert!(msg.contains("Juan Pérez"));
        assert!(msg.contains("¿Deseas confirmar esta cita?"));
    }

    #[test]
    fn same_date_alternatives_are_enumerated() {
        let block = AvailabilityBlock {
            available: true,
            exact_match: false,
            slots_for_date: true,
            alternatives: alternatives(3),
            ..Default::default()
        };
        let msg = confirmation_message(&draft(), &block, "9 de junio de 2025", "09:00 AM");
        assert!(msg.contains("La hora exacta solicitada no está disponible"));
        assert!(msg.contains("1. 📅"));
        assert!(msg.contains("3. 📅"));
        assert!(msg.contains("Responde con el número"));
    }

    #[test]
    fn other_date_alternatives_use_next_available_framing() {
        let block = AvailabilityBlock {
            available: false,
            exact_match: false,
            slots_for_date: false,
            alternatives: alternatives(2),
            ..Default::default()
        };
        let msg = confirmation_message(&draft(), &block, "9 de junio de 2025", "09:00 AM");
        assert!(msg.contains("Próximos horarios disponibles"));
    }

    #[test]
    fn no_alternatives_directs_to_office() {
        let block = AvailabilityBlock::default();
        let msg = confirmation_message(&draft(), &block, "9 de junio de 2025", "09:00 AM");
        assert!(msg.contains("no hay horarios disponibles"));
        assert!(msg.contains("contacta directamente al consultorio"));
    }

    #[test]
    fn auth_failure_short_circuits() {
        let block = AvailabilityBlock {
            error: Some("authentication_failed".into()),
            message: Some(AUTH_FAILED_MESSAGE.into()),
            ..Default::default()
        };
        let msg = confirmation_message(&draft(), &block, "x", "y");
        assert_eq!(msg, AUTH_FAILED_MESSAGE);
    }

    #[test]
    fn payment_link_formats_minor_units() {
        let msg = payment_link_message(50_000, "mxn", "https://pay.example.com/x");
        assert!(msg.contains("$500.00 MXN"));
        assert!(msg.contains("30 minutos"));
        assert!(msg.contains("https://pay.example.com/x"));
    }
}
