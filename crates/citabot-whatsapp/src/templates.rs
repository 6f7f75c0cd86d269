//! Pre-approved template payloads and the Spanish reminder texts.

use serde_json::{json, Value};

pub const APPOINTMENT_CONFIRMATION_TEMPLATE: &str = "appointment_confirmation";
pub const APPOINTMENT_REMINDER_TEMPLATE: &str = "appointment_reminder";
pub const DEFAULT_LANGUAGE: &str = "es_MX";

/// `appointment_confirmation` body parameters, in template order:
/// patient, date, time, doctor, location.
pub fn confirmation_template(
    to: &str,
    patient_name: &str,
    appointment_date: &str,
    appointment_time: &str,
    doctor_name: &str,
    location: &str,
) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "template",
        "template": {
            "name": APPOINTMENT_CONFIRMATION_TEMPLATE,
            "language": {"code": DEFAULT_LANGUAGE},
            "components": [{
                "type": "body",
                "parameters": [
                    {"type": "text", "text": patient_name},
                    {"type": "text", "text": appointment_date},
                    {"type": "text", "text": appointment_time},
                    {"type": "text", "text": doctor_name},
                    {"type": "text", "text": location},
                ]
            }]
        }
    })
}

/// `appointment_reminder` body parameters: patient, local time, service.
pub fn reminder_template(
    to: &str,
    patient_name: &str,
    appointment_time: &str,
    calendar_name: &str,
) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "template",
        "template": {
            "name": APPOINTMENT_REMINDER_TEMPLATE,
            "language": {"code": DEFAULT_LANGUAGE},
            "components": [{
                "type": "body",
                "parameters": [
                    {"type": "text", "text": patient_name},
                    {"type": "text", "text": appointment_time},
                    {"type": "text", "text": calendar_name},
                ]
            }]
        }
    })
}

/// Generic template with ordered body/header/button parameters.
pub fn generic_template(
    to: &str,
    name: &str,
    language_code: &str,
    body_params: &[&str],
    header_params: &[&str],
    button_params: &[&str],
) -> Value {
    let mut components = Vec::new();
    if !header_params.is_empty() {
        components.push(json!({
            "type": "header",
            "parameters": header_params.iter()
                .map(|p| json!({"type": "text", "text": p}))
                .collect::<Vec<_>>(),
        }));
    }
    if !body_params.is_empty() {
        components.push(json!({
            "type": "body",
            "parameters": body_params.iter()
                .map(|p| json!({"type": "text", "text": p}))
                .collect::<Vec<_>>(),
        }));
    }
    for (i, param) in button_params.iter().enumerate() {
        components.push(json!({
            "type": "button",
            "sub_type": "url",
            "index": i.to_string(),
            "parameters": [{"type": "text", "text": param}],
        }));
    }

    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "template",
        "template": {
            "name": name,
            "language": {"code": language_code},
            "components": components,
        }
    })
}

// ── Reminder texts (plain-message fallbacks and replies) ──────────────────────

pub fn greeting_for_hour(hour: u32) -> &'static str {
    if hour < 12 {
        "¡Buenos días"
    } else if hour < 19 {
        "¡Buenas tardes"
    } else {
        "¡Buenas noches"
    }
}

/// Plain-text reminder fallback when the template cannot be used.
pub fn reminder_text(
    hour: u32,
    customer_name: &str,
    appointment_time: &str,
    calendar_name: Option<&str>,
) -> String {
    let greeting = greeting_for_hour(hour);
    match calendar_name {
        Some(calendar) => format!(
            "{greeting} {customer_name}! 👋\n\n\
             Este es un recordatorio amistoso de que tiene una cita programada para hoy:\n\n\
             📅 *Cita:* {calendar}\n\
             🕐 *Hora:* {appointment_time}\n\n\
             Por favor, llegue 10 minutos antes de su cita.\n\n\
             Si necesita cancelar o reprogramar, responda a este mensaje y con gusto le ayudaremos.\n\n\
             ¡Esperamos verle pronto! 😊"
        ),
        None => format!(
            "{greeting} {customer_name}! 👋\n\n\
             Este es un recordatorio amistoso de que tiene una cita programada para hoy a las *{appointment_time}*.\n\n\
             Por favor, llegue 10 minutos antes de su cita.\n\n\
             Si necesita cancelar o reprogramar, responda a este mensaje y con gusto le ayudaremos.\n\n\
             ¡Esperamos verle pronto! 😊"
        ),
    }
}

pub fn confirmation_thanks() -> &'static str {
    "¡Perfecto! ✅ Hemos confirmado su asistencia.\n\n\
     Le esperamos en su cita. Recuerde llegar 10 minutos antes.\n\n\
     ¡Hasta pronto! 😊"
}

pub fn cancellation_confirmed() -> &'static str {
    "✅ Su cita ha sido cancelada exitosamente.\n\n\
     Si desea agendar una nueva cita en el futuro, no dude en contactarnos.\n\n\
     ¡Que tenga un excelente día! 😊"
}

pub fn cancellation_failed() -> &'static str {
    "❌ Hubo un problema al cancelar su cita.\n\n\
     Por favor contacte directamente al consultorio para cancelar."
}

pub fn reschedule_prompt() -> &'static str {
    "📅 Para reprogramar su cita, por favor indíqueme:\n\n\
     • ¿Qué día prefiere? (ejemplo: mañana, viernes, 20 de julio)\n\
     • ¿A qué hora le conviene? (ejemplo: 10:00 AM, 3:30 PM)\n\n\
     Le buscaré los horarios disponibles más cercanos a su preferencia."
}

pub fn reschedule_lookup_failed() -> &'static str {
    "❌ No pude encontrar los detalles de su cita.\n\n\
     Por favor contacte directamente al consultorio para reprogramar."
}

pub fn reminder_options_body() -> &'static str {
    "¿Qué desea hacer con su cita de hoy?\n\nPor favor seleccione una opción:"
}

pub fn expired_reminder() -> &'static str {
    "❌ Lo siento, no pude procesar su respuesta. El recordatorio puede haber expirado.\n\n\
     Por favor contacte directamente al consultorio."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_template_parameter_order() {
        let t = confirmation_template(
            "5213319858734",
            "Juan Pérez",
            "lunes, 25 de julio de 2025",
            "10:00 a.m.",
            "Dra. García",
            "Av. Siempre Viva 742",
        );
        assert_eq!(t["template"]["name"], "appointment_confirmation");
        assert_eq!(t["template"]["language"]["code"], "es_MX");
        let params = t["template"]["components"][0]["parameters"].as_array().unwrap();
        let texts: Vec<&str> = params.iter().map(|p| p["text"].as_str().unwrap()).collect();
        assert_eq!(
            texts,
            vec![
                "Juan Pérez",
                "lunes, 25 de julio de 2025",
                "10:00 a.m.",
                "Dra. García",
                "Av. Siempre Viva 742"
            ]
        );
    }

    #[test]
    fn reminder_template_has_three_parameters() {
        let t = reminder_template("5213319858734", "Juan", "10:00 AM", "Consulta general");
        let params = t["template"]["components"][0]["parameters"].as_array().unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(t["template"]["name"], "appointment_reminder");
    }

    #[test]
    fn generic_template_orders_components() {
        let t = generic_template(
            "521333",
            "invoice_notice",
            "es_MX",
            &["Juan", "$500.00"],
            &["Factura"],
            &["inv_123"],
        );
        let components = t["template"]["components"].as_array().unwrap();
        assert_eq!(components[0]["type"], "header");
        assert_eq!(components[1]["type"], "body");
        assert_eq!(components[2]["type"], "button");
        assert_eq!(components[2]["index"], "0");
    }

    #[test]
    fn greeting_tracks_hour() {
        assert_eq!(greeting_for_hour(8), "¡Buenos días");
        assert_eq!(greeting_for_hour(13), "¡Buenas tardes");
        assert_eq!(greeting_for_hour(21), "¡Buenas noches");
    }

    #[test]
    fn reminder_text_includes_calendar_when_present() {
        let with = reminder_text(9, "Juan", "10:00 AM", Some("Consulta"));
        assert!(with.contains("📅 *Cita:* Consulta"));
        let without = reminder_text(9, "Juan", "10:00 AM", None);
        assert!(without.contains("*10:00 AM*"));
        assert!(!without.contains("📅 *Cita:*"));
    }
}
