//! Spanish system prompts for the conversational turn and the structured
//! extractor. Both carry the tenant-local current date so relative dates
//! ("mañana", "próximo lunes") resolve correctly.

use chrono::{Datelike, Weekday};
use chrono_tz::Tz;

fn spanish_weekday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Lunes",
        Weekday::Tue => "Martes",
        Weekday::Wed => "Miércoles",
        Weekday::Thu => "Jueves",
        Weekday::Fri => "Viernes",
        Weekday::Sat => "Sábado",
        Weekday::Sun => "Domingo",
    }
}

/// System prompt for the conversational turn generator.
pub fn conversation_prompt(
    tz: Tz,
    now_utc: chrono::DateTime<chrono::Utc>,
    custom_prompt: Option<&str>,
    context: Option<&str>,
) -> String {
    let now = now_utc.with_timezone(&tz);
    let current_date = now.format("%Y-%m-%d");
    let current_year = now.year();
    let day = spanish_weekday(now.weekday());

    let mut prompt = format!(
        "Eres un asistente virtual amigable que ayuda a agendar citas médicas.\n\
         Tu objetivo es recopilar la información necesaria para agendar una cita: \
         nombre del paciente, motivo de la cita, y fecha/hora deseada.\n\n\
         INFORMACIÓN IMPORTANTE:\n\
         - Fecha de hoy: {day}, {current_date}\n\
         - Año actual: {current_year}\n\n\
         Instrucciones:\n\
         1. Saluda amablemente y pregunta en qué puedes ayudar\n\
         2. Si el usuario quiere agendar una cita, recopila:\n\
            - Nombre completo\n\
            - Motivo de la consulta\n\
            - Fecha y hora preferida\n\
         3. Sé conversacional y natural\n\
         4. Responde siempre en español\n\
         5. Si el usuario pregunta algo no relacionado con citas, indícale amablemente \
         que solo puedes ayudar con el agendamiento de citas\n\
         6. Cuando el usuario mencione fechas relativas (mañana, pasado mañana, próximo \
         lunes, etc.), usa la fecha de hoy como referencia\n\
         7. Si el usuario no especifica el año, asume que es {current_year}"
    );

    if let Some(custom) = custom_prompt {
        prompt.push_str("\n\nInstrucciones adicionales del negocio:\n");
        prompt.push_str(custom);
    }
    if let Some(context) = context {
        prompt.push_str("\n\nContexto de la conversación:\n");
        prompt.push_str(context);
    }
    prompt
}

/// System prompt for the structured appointment-intent extractor. The
/// model must answer with a single JSON object.
pub fn extraction_prompt(
    tz: Tz,
    now_utc: chrono::DateTime<chrono::Utc>,
    custom_prompt: Option<&str>,
) -> String {
    let now = now_utc.with_timezone(&tz);
    let current_date = now.format("%Y-%m-%d");
    let current_year = now.year();

    let mut prompt = format!(
        "Eres un asistente que extrae información de citas médicas de conversaciones en español.\n\n\
         FECHA ACTUAL: {current_date}\n\
         AÑO ACTUAL: {current_year}\n\n\
         Analiza la conversación y extrae la siguiente información si está disponible:\n\
         - Nombre del paciente\n\
         - Motivo de la cita\n\
         - Fecha y hora deseada\n\n\
         IMPORTANTE para fechas:\n\
         - Si la fecha/hora no está clara o completa, devuelve null para datetime\n\
         - Interpreta fechas relativas como \"mañana\", \"lunes\", \"próxima semana\" \
         basándote en la FECHA ACTUAL proporcionada\n\
         - SIEMPRE usa el AÑO ACTUAL ({current_year}) a menos que el usuario especifique \
         explícitamente otro año\n\
         - Para fechas como \"mañana\" usa {current_date} como referencia\n\
         - Si el usuario dice una fecha como \"6 de junio\" sin año, asume que es {current_year}\n\
         - Usa el formato ISO 8601 para datetime (YYYY-MM-DDTHH:MM:SS)\n\n\
         Responde ÚNICAMENTE con un objeto JSON en este formato:\n\
         {{\n\
             \"has_appointment_info\": true/false,\n\
             \"name\": \"nombre completo o null\",\n\
             \"reason\": \"motivo de la cita o null\",\n\
             \"datetime\": \"YYYY-MM-DDTHH:00:00 o null\",\n\
             \"raw_datetime\": \"texto original de fecha/hora mencionado por el usuario o null\"\n\
         }}\n\n\
         Si no hay suficiente información para una cita, devuelve has_appointment_info como false."
    );

    if let Some(custom) = custom_prompt {
        prompt.push_str("\n\nContexto adicional:\n");
        prompt.push_str(custom);
    }
    prompt
}

/// System prompt for the standalone name-extraction pass.
pub fn name_extraction_prompt() -> &'static str {
    "You are a name extraction assistant. Your task is to extract the customer's name from the conversation.\n\n\
     Rules:\n\
     1. Only extract the name if the customer explicitly provides it\n\
     2. Do not infer or guess names\n\
     3. Return ONLY the name, nothing else\n\
     4. If no name is found, return \"NO_NAME_FOUND\"\n\n\
     Examples:\n\
     - \"Hola, soy Juan Pérez\" → \"Juan Pérez\"\n\
     - \"Mi nombre es María\" → \"María\"\n\
     - \"Hola, quiero agendar una cita\" → \"NO_NAME_FOUND\""
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn conversation_prompt_carries_local_date() {
        let tz: Tz = "America/Mexico_City".parse().unwrap();
        // 2025-07-25 03:00 UTC is still 2025-07-24 in Mexico City.
        let now = chrono::Utc.with_ymd_and_hms(2025, 7, 25, 3, 0, 0).unwrap();
        let prompt = conversation_prompt(tz, now, None, None);
        assert!(prompt.contains("2025-07-24"));
        assert!(prompt.contains("Año actual: 2025"));
        assert!(prompt.contains("Jueves"));
    }

    #[test]
    fn custom_prompt_is_appended() {
        let tz: Tz = "America/Mexico_City".parse().unwrap();
        let now = chrono::Utc.with_ymd_and_hms(2025, 7, 25, 18, 0, 0).unwrap();
        let prompt = conversation_prompt(tz, now, Some("Solo citas de odontología."), None);
        assert!(prompt.ends_with("Solo citas de odontología."));
    }

    #[test]
    fn extraction_prompt_demands_json() {
        let tz: Tz = "America/Mexico_City".parse().unwrap();
        let now = chrono::Utc.with_ymd_and_hms(2025, 7, 25, 18, 0, 0).unwrap();
        let prompt = extraction_prompt(tz, now, None);
        assert!(prompt.contains("has_appointment_info"));
        assert!(prompt.contains("raw_datetime"));
        assert!(prompt.contains("FECHA ACTUAL: 2025-07-25"));
    }
}
