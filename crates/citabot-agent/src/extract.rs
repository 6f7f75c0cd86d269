//! Structured extraction over the conversation transcript.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::prompts;
use crate::provider::{ChatMessage, LlmProvider};

/// Raw JSON object the extractor model returns.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawIntent {
    #[serde(default)]
    pub has_appointment_info: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub datetime: Option<String>,
    #[serde(default)]
    pub raw_datetime: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A validated intent: complete fields, future instant.
#[derive(Debug, Clone)]
pub struct AppointmentIntent {
    pub name: String,
    pub reason: String,
    /// Tenant-local instant.
    pub datetime: DateTime<Tz>,
    /// ISO 8601 form of `datetime` for storage.
    pub datetime_iso: String,
    pub raw_datetime: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
}

/// Extraction runner over any [`LlmProvider`].
pub struct Extractor<'a> {
    provider: &'a dyn LlmProvider,
}

impl<'a> Extractor<'a> {
    pub fn new(provider: &'a dyn LlmProvider) -> Self {
        Self { provider }
    }

    /// Structured-intent pass: flattened transcript in, validated intent
    /// out. Returns `None` when the model reports incomplete info, emits
    /// unparseable JSON, or names a past instant. A missing name does not
    /// block completion when the chat platform supplied a profile name.
    pub async fn extract_intent(
        &self,
        conversation_text: &str,
        custom_prompt: Option<&str>,
        fallback_name: Option<&str>,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Option<AppointmentIntent> {
        let system = prompts::extraction_prompt(tz, now, custom_prompt);
        let content = self
            .provider
            .chat(&system, &[ChatMessage::user(conversation_text)])
            .await
            .map_err(|e| warn!(error = %e, "intent extraction call failed"))
            .ok()?;

        let raw = parse_intent_json(&content)?;
        validate_intent(raw, fallback_name, tz, now)
    }

    /// Name-only pass, so a contact can be created before the full intent
    /// is complete.
    pub async fn extract_name(&self, conversation_text: &str) -> Option<String> {
        let content = self
            .provider
            .chat(
                prompts::name_extraction_prompt(),
                &[ChatMessage::user(conversation_text)],
            )
            .await
            .map_err(|e| warn!(error = %e, "name extraction call failed"))
            .ok()?;

        let name = content.trim();
        if name.is_empty() || name == "NO_NAME_FOUND" {
            return None;
        }
        info!(%name, "extracted customer name");
        Some(name.to_string())
    }
}

/// Parse the extractor output, tolerating JSON wrapped in markdown fences.
pub fn parse_intent_json(content: &str) -> Option<RawIntent> {
    if let Ok(raw) = serde_json::from_str::<RawIntent>(content.trim()) {
        return Some(raw);
    }
    if let Some(inner) = fenced_json(content) {
        if let Ok(raw) = serde_json::from_str::<RawIntent>(inner) {
            debug!("extracted intent from fenced JSON");
            return Some(raw);
        }
    }
    warn!("extractor output was not parseable JSON");
    None
}

/// The body of the first ```json (or bare ```) fence, if any.
fn fenced_json(content: &str) -> Option<&str> {
    let start = content.find("```")?;
    let after_fence = &content[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Enforce completeness and the future-instant rule.
pub fn validate_intent(
    raw: RawIntent,
    fallback_name: Option<&str>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<AppointmentIntent> {
    if !raw.has_appointment_info {
        return None;
    }
    let name = raw
        .name
        .filter(|n| !n.is_empty() && n != "null")
        .or_else(|| fallback_name.map(String::from))?;
    let reason = raw.reason.filter(|r| !r.is_empty() && r != "null")?;
    let datetime_str = raw.datetime.filter(|d| !d.is_empty() && d != "null")?;

    let local = parse_local_datetime(&datetime_str, tz)?;
    if local.with_timezone(&Utc) <= now {
        warn!(datetime = %datetime_str, "intent instant is in the past, rejecting");
        return None;
    }

    Some(AppointmentIntent {
        datetime_iso: local.to_rfc3339(),
        name,
        reason,
        datetime: local,
        raw_datetime: raw.raw_datetime,
        email: raw.email.filter(|e| !e.is_empty() && e != "null"),
        notes: raw.notes.filter(|n| !n.is_empty() && n != "null"),
    })
}

/// Parse an extractor datetime. Offset-qualified strings convert into the
/// tenant timezone; naive strings are taken as already tenant-local.
pub fn parse_local_datetime(s: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&tz));
    }
    if let Some(stripped) = s.strip_suffix('Z') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%dT%H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive).with_timezone(&tz));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return tz.from_local_datetime(&naive).single();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tz() -> Tz {
        "America/Mexico_City".parse().unwrap()
    }

    fn past_proof_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn plain_json_parses() {
        let raw = parse_intent_json(
            r#"{"has_appointment_info": true, "name": "Juan Pérez",
                "reason": "dolor de espalda", "datetime": "2025-06-09T10:00:00",
                "raw_datetime": "mañana a las 10am"}"#,
        )
        .unwrap();
        assert!(raw.has_appointment_info);
        assert_eq!(raw.name.as_deref(), Some("Juan Pérez"));
    }

    #[test]
    fn fenced_json_parses() {
        let content = "Aquí está la información:\n```json\n{\"has_appointment_info\": true, \"name\": \"María\", \"reason\": \"consulta\", \"datetime\": \"2025-06-09T10:00:00\"}\n```\nSaludos.";
        let raw = parse_intent_json(content).unwrap();
        assert_eq!(raw.name.as_deref(), Some("María"));
    }

    #[test]
    fn non_json_returns_none() {
        assert!(parse_intent_json("no tengo información de cita").is_none());
    }

    #[test]
    fn incomplete_intent_is_rejected() {
        let raw = RawIntent {
            has_appointment_info: true,
            name: Some("Juan".into()),
            reason: None,
            datetime: Some("2025-06-09T10:00:00".into()),
            ..Default::default()
        };
        assert!(validate_intent(raw, None, tz(), past_proof_now()).is_none());
    }

    #[test]
    fn null_strings_count_as_missing() {
        let raw = RawIntent {
            has_appointment_info: true,
            name: Some("null".into()),
            reason: Some("consulta".into()),
            datetime: Some("2025-06-09T10:00:00".into()),
            ..Default::default()
        };
        assert!(validate_intent(raw, None, tz(), past_proof_now()).is_none());
    }

    #[test]
    fn past_instant_is_rejected() {
        let raw = RawIntent {
            has_appointment_info: true,
            name: Some("Juan".into()),
            reason: Some("consulta".into()),
            datetime: Some("2024-01-01T10:00:00".into()),
            ..Default::default()
        };
        assert!(validate_intent(raw, None, tz(), past_proof_now()).is_none());
    }

    #[test]
    fn future_naive_instant_is_tenant_local() {
        let raw = RawIntent {
            has_appointment_info: true,
            name: Some("Juan".into()),
            reason: Some("consulta".into()),
            datetime: Some("2025-06-09T10:00:00".into()),
            raw_datetime: Some("el 9 de junio a las 10".into()),
            ..Default::default()
        };
        let intent = validate_intent(raw, None, tz(), past_proof_now()).unwrap();
        assert_eq!(intent.datetime.format("%H:%M").to_string(), "10:00");
        assert_eq!(intent.datetime.format("%Y-%m-%d").to_string(), "2025-06-09");
        // Mexico City is UTC-6 in June (no DST since 2022).
        assert!(intent.datetime_iso.contains("-06:00"));
    }

    #[test]
    fn offset_qualified_instant_converts() {
        let dt = parse_local_datetime("2025-06-09T16:00:00Z", tz()).unwrap();
        assert_eq!(dt.format("%H:%M").to_string(), "10:00");
    }
}
