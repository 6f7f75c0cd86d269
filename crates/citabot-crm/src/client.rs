use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use citabot_core::phone::{format_for_crm, phones_match};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::auth::CrmAuth;
use crate::error::{CrmError, Result};
use crate::types::{CalendarEvent, Contact, FreeSlot};

const API_VERSION: &str = "2021-07-28";
/// Blocked-slot listing requires the older API version.
const BLOCKED_SLOTS_VERSION: &str = "2021-04-15";
const CALL_TIMEOUT_SECS: u64 = 30;

/// Client for the calendar/CRM API. All calls authenticate through
/// [`CrmAuth`], which refreshes the tenant token when expired.
#[derive(Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    auth: Arc<CrmAuth>,
    base_url: String,
}

impl CrmClient {
    pub fn new(auth: Arc<CrmAuth>, base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALL_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            http,
            auth,
            base_url,
        }
    }

    pub fn auth(&self) -> &CrmAuth {
        &self.auth
    }

    async fn bearer(&self, account_id: &str) -> Result<String> {
        self.auth.bearer_token(account_id).await
    }

    // ── Contacts ──────────────────────────────────────────────────────────

    /// Create a contact, or return the existing one when the phone already
    /// matches a contact in the location. Never creates a duplicate.
    #[instrument(skip(self, email, reason), fields(%account_id, %name))]
    pub async fn create_contact(
        &self,
        account_id: &str,
        location_id: &str,
        name: &str,
        phone: &str,
        email: Option<&str>,
        reason: Option<&str>,
        source: &str,
    ) -> Result<Contact> {
        let crm_phone = format_for_crm(phone)
            .ok_or_else(|| CrmError::Parse(format!("unusable phone: {phone}")))?;

        if let Some(existing) = self
            .search_contact_by_phone(account_id, location_id, &crm_phone)
            .await?
        {
            info!(contact_id = %existing.id, "contact already exists, reusing");
            return Ok(existing);
        }

        let token = self.bearer(account_id).await?;
        let mut body = json!({
            "locationId": location_id,
            "name": name,
            "phone": crm_phone,
            "source": source,
        });
        if let Some(email) = email {
            body["email"] = json!(email);
        }
        if let Some(reason) = reason {
            body["customFields"] = json!([
                {"key": "reason_of_appointment", "value": reason}
            ]);
        }

        let resp = self
            .http
            .post(format!("{}/contacts/", self.base_url))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            // Duplicate-contact 400s carry the existing id; treat as success.
            if status == 400 {
                if let Some(existing_id) = duplicate_contact_id(&text) {
                    info!(contact_id = %existing_id, "recovered existing contact from duplicate error");
                    return Ok(Contact {
                        id: existing_id,
                        name: Some(name.to_string()),
                        first_name: None,
                        phone: Some(crm_phone),
                        email: email.map(String::from),
                    });
                }
            }
            warn!(status, body = %text, "contact creation failed");
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        let wrapper: ContactWrapper = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        info!(contact_id = %wrapper.contact.id, "created contact");
        Ok(wrapper.contact)
    }

    #[instrument(skip(self, name, email, reason))]
    pub async fn update_contact(
        &self,
        account_id: &str,
        contact_id: &str,
        name: Option<&str>,
        email: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Contact> {
        let token = self.bearer(account_id).await?;
        let mut body = serde_json::Map::new();
        if let Some(name) = name {
            body.insert("name".into(), json!(name));
        }
        if let Some(email) = email {
            body.insert("email".into(), json!(email));
        }
        if let Some(reason) = reason {
            body.insert("tags".into(), json!([reason]));
        }

        let resp = self
            .http
            .put(format!("{}/contacts/{contact_id}", self.base_url))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .json(&serde_json::Value::Object(body))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        let wrapper: ContactWrapper = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        Ok(wrapper.contact)
    }

    /// Search contacts in a location and pick the one whose phone matches
    /// after canonicalization.
    pub async fn search_contact_by_phone(
        &self,
        account_id: &str,
        location_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>> {
        let token = self.bearer(account_id).await?;
        let resp = self
            .http
            .get(format!("{}/contacts/", self.base_url))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .query(&[("locationId", location_id), ("query", phone)])
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = r.status().as_u16(), "contact search failed");
                return Ok(None);
            }
            Err(e) => {
                debug!(error = %e, "contact search request failed");
                return Ok(None);
            }
        };

        let wrapper: ContactsWrapper = match resp.json().await {
            Ok(w) => w,
            Err(_) => return Ok(None),
        };

        Ok(wrapper
            .contacts
            .into_iter()
            .find(|c| c.phone.as_deref().is_some_and(|p| phones_match(p, phone))))
    }

    pub async fn get_contact(&self, account_id: &str, contact_id: &str) -> Result<Option<Contact>> {
        let token = self.bearer(account_id).await?;
        let resp = self
            .http
            .get(format!("{}/contacts/{contact_id}", self.base_url))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        // The API sometimes nests under `contact`, sometimes not.
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        let contact_value = value.get("contact").cloned().unwrap_or(value);
        let contact: Contact = serde_json::from_value(contact_value)
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        Ok(Some(contact))
    }

    // ── Appointments ──────────────────────────────────────────────────────

    #[instrument(skip(self), fields(%account_id, %contact_id, %start_time))]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_appointment(
        &self,
        account_id: &str,
        calendar_id: &str,
        location_id: &str,
        contact_id: &str,
        assigned_user_id: &str,
        start_time: &str,
        end_time: &str,
        title: &str,
    ) -> Result<CalendarEvent> {
        let token = self.bearer(account_id).await?;
        let body = json!({
            "calendarId": calendar_id,
            "locationId": location_id,
            "contactId": contact_id,
            "startTime": start_time,
            "endTime": end_time,
            "title": title,
            "appointmentStatus": "confirmed",
            "assignedUserId": assigned_user_id,
            "ignoreFreeSlotValidation": false,
        });

        let resp = self
            .http
            .post(format!("{}/calendars/events/appointments", self.base_url))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "appointment creation failed");
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        let appointment: CalendarEvent = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        info!(appointment_id = %appointment.id, "created appointment");
        Ok(appointment)
    }

    pub async fn get_appointment(
        &self,
        account_id: &str,
        appointment_id: &str,
    ) -> Result<Option<CalendarEvent>> {
        let token = self.bearer(account_id).await?;
        let resp = self
            .http
            .get(format!(
                "{}/calendars/events/appointments/{appointment_id}",
                self.base_url
            ))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            warn!(%appointment_id, "appointment not found");
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        let event_value = value.get("appointment").or(value.get("event")).cloned().unwrap_or(value);
        let event: CalendarEvent =
            serde_json::from_value(event_value).map_err(|e| CrmError::Parse(e.to_string()))?;
        Ok(Some(event))
    }

    /// Reschedule: move start/end, optionally retitle.
    #[instrument(skip(self))]
    pub async fn update_appointment(
        &self,
        account_id: &str,
        appointment_id: &str,
        start_time: &str,
        end_time: &str,
        title: Option<&str>,
    ) -> Result<CalendarEvent> {
        let token = self.bearer(account_id).await?;
        let mut body = json!({
            "startTime": start_time,
            "endTime": end_time,
        });
        if let Some(title) = title {
            body["title"] = json!(title);
        }

        let resp = self
            .http
            .put(format!(
                "{}/calendars/events/appointments/{appointment_id}",
                self.base_url
            ))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "appointment update failed");
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        let event: CalendarEvent = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        info!(%appointment_id, new_start = %start_time, "rescheduled appointment");
        Ok(event)
    }

    /// Cancel by setting appointmentStatus=cancelled. Returns false when
    /// the CRM rejects the update.
    #[instrument(skip(self))]
    pub async fn cancel_appointment(&self, account_id: &str, appointment_id: &str) -> Result<bool> {
        let token = self.bearer(account_id).await?;
        let resp = self
            .http
            .put(format!(
                "{}/calendars/events/appointments/{appointment_id}",
                self.base_url
            ))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .json(&json!({"appointmentStatus": "cancelled"}))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "appointment cancellation failed");
            return Ok(false);
        }
        info!(%appointment_id, "cancelled appointment");
        Ok(true)
    }

    /// Calendar events (appointments) in a ms-epoch window. Used by the
    /// reminder batch.
    pub async fn get_calendar_events(
        &self,
        account_id: &str,
        location_id: &str,
        calendar_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<CalendarEvent>> {
        let token = self.bearer(account_id).await?;
        let resp = self
            .http
            .get(format!("{}/calendars/events", self.base_url))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .query(&[
                ("locationId", location_id.to_string()),
                ("calendarId", calendar_id.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
            ])
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        let wrapper: EventsWrapper = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        Ok(wrapper.events)
    }

    // ── Slots ─────────────────────────────────────────────────────────────

    /// Free slots in a ms-epoch window, normalized to (date, time, datetime)
    /// regardless of which of the two shapes the CRM returns.
    #[instrument(skip(self), fields(%account_id, %calendar_id))]
    pub async fn get_free_slots(
        &self,
        account_id: &str,
        calendar_id: &str,
        start_ms: i64,
        end_ms: i64,
        timezone: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<FreeSlot>> {
        let token = self.bearer(account_id).await?;
        let mut query = vec![
            ("startDate", start_ms.to_string()),
            ("endDate", end_ms.to_string()),
            ("timezone", timezone.to_string()),
            ("enableLookBusy", "false".to_string()),
        ];
        if let Some(uid) = user_id {
            query.push(("userId", uid.to_string()));
        }

        let resp = self
            .http
            .get(format!(
                "{}/calendars/{calendar_id}/free-slots",
                self.base_url
            ))
            .bearer_auth(&token)
            .header("Version", API_VERSION)
            .query(&query)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CrmError::Api {
                status,
                message: text,
            });
        }

        let raw: BTreeMap<String, serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| CrmError::Parse(e.to_string()))?;
        let slots = parse_free_slots(&raw);
        info!(
            slot_count = slots.len(),
            dates = raw.len(),
            "retrieved free slots"
        );
        Ok(slots)
    }

    /// Blocked slots in a ms-epoch window. Passes calendarId when present,
    /// else userId — never both. Errors degrade to an empty list so the
    /// booking flow keeps working when the endpoint misbehaves.
    #[instrument(skip(self), fields(%account_id))]
    pub async fn get_blocked_slots(
        &self,
        account_id: &str,
        location_id: &str,
        calendar_id: Option<&str>,
        user_id: Option<&str>,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<CalendarEvent> {
        let token = match self.bearer(account_id).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "blocked-slot auth failed, returning empty");
                return Vec::new();
            }
        };

        let mut query = vec![
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("locationId", location_id.to_string()),
        ];
        match (calendar_id, user_id) {
            (Some(cal), _) => query.push(("calendarId", cal.to_string())),
            (None, Some(uid)) => query.push(("userId", uid.to_string())),
            (None, None) => {
                warn!("blocked-slot query needs calendar_id or user_id");
                return Vec::new();
            }
        }

        let resp = self
            .http
            .get(format!("{}/calendars/blocked-slots", self.base_url))
            .bearer_auth(&token)
            .header("Version", BLOCKED_SLOTS_VERSION)
            .query(&query)
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = r.status().as_u16(), "blocked-slot request failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "blocked-slot request failed");
                return Vec::new();
            }
        };

        match resp.json::<EventsWrapper>().await {
            Ok(w) => {
                debug!(blocked_count = w.events.len(), "retrieved blocked slots");
                w.events
            }
            Err(e) => {
                warn!(error = %e, "blocked-slot response unparseable");
                Vec::new()
            }
        }
    }
}

/// Parse the free-slots map `{ "YYYY-MM-DD": {"slots": [...]}, ... }`.
///
/// Each slot entry is either a bare `HH:MM` or a full ISO datetime; both
/// normalize to the same triple. Any other shape is skipped.
pub fn parse_free_slots(raw: &BTreeMap<String, serde_json::Value>) -> Vec<FreeSlot> {
    let mut out = Vec::new();
    for (date_key, date_data) in raw {
        let Some(slots) = date_data.get("slots").and_then(|s| s.as_array()) else {
            continue;
        };
        for entry in slots {
            let Some(text) = entry.as_str() else {
                continue;
            };
            if let Some(t_pos) = text.find('T') {
                // Full ISO datetime: pull HH:MM out of the time part.
                let time_part = &text[t_pos + 1..];
                if time_part.len() < 5 {
                    warn!(slot = %text, "skipping unrecognized slot shape");
                    continue;
                }
                out.push(FreeSlot {
                    date: date_key.clone(),
                    time: time_part[..5].to_string(),
                    datetime: text.to_string(),
                });
            } else if text.len() == 5 && text.as_bytes()[2] == b':' {
                // Bare HH:MM: qualify with the date key.
                out.push(FreeSlot {
                    date: date_key.clone(),
                    time: text.to_string(),
                    datetime: format!("{date_key}T{text}:00"),
                });
            } else {
                warn!(slot = %text, "skipping unrecognized slot shape");
            }
        }
    }
    out
}

/// Extract `meta.contactId` from a duplicate-contact 400 body.
pub fn duplicate_contact_id(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value.get("message")?.as_str()?;
    if !message.contains("duplicated contacts") {
        return None;
    }
    value
        .get("meta")?
        .get("contactId")?
        .as_str()
        .map(String::from)
}

#[derive(Deserialize)]
struct ContactWrapper {
    contact: Contact,
}

#[derive(Deserialize)]
struct ContactsWrapper {
    #[serde(default)]
    contacts: Vec<Contact>,
}

#[derive(Deserialize)]
struct EventsWrapper {
    #[serde(default)]
    events: Vec<CalendarEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slots_parse_bare_times() {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_value(serde_json::json!({
            "2025-06-09": {"slots": ["09:00", "10:00", "14:30"]},
        }))
        .unwrap();
        let slots = parse_free_slots(&raw);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].date, "2025-06-09");
        assert_eq!(slots[0].time, "09:00");
        assert_eq!(slots[0].datetime, "2025-06-09T09:00:00");
        assert_eq!(slots[2].time, "14:30");
    }

    #[test]
    fn free_slots_parse_full_datetimes() {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_value(serde_json::json!({
            "2025-06-09": {"slots": ["2025-06-09T14:00:00", "2025-06-09T15:00:00-06:00"]},
        }))
        .unwrap();
        let slots = parse_free_slots(&raw);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].time, "14:00");
        assert_eq!(slots[0].datetime, "2025-06-09T14:00:00");
        assert_eq!(slots[1].time, "15:00");
    }

    #[test]
    fn free_slots_mixed_shapes_and_garbage() {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_value(serde_json::json!({
            "2025-06-09": {"slots": ["09:00", "2025-06-09T10:00:00", "??", 42]},
            "2025-06-10": {"other": true},
        }))
        .unwrap();
        let slots = parse_free_slots(&raw);
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn free_slots_preserve_date_ordering() {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_value(serde_json::json!({
            "2025-06-10": {"slots": ["09:00"]},
            "2025-06-09": {"slots": ["11:00"]},
        }))
        .unwrap();
        let slots = parse_free_slots(&raw);
        assert_eq!(slots[0].date, "2025-06-09");
        assert_eq!(slots[1].date, "2025-06-10");
    }

    #[test]
    fn duplicate_contact_error_recovers_id() {
        let body = r#"{
            "statusCode": 400,
            "message": "This location does not allow duplicated contacts.",
            "meta": {"contactId": "abc123", "matchingField": "phone"}
        }"#;
        assert_eq!(duplicate_contact_id(body).as_deref(), Some("abc123"));
    }

    #[test]
    fn other_400s_are_not_recovered() {
        assert_eq!(duplicate_contact_id(r#"{"message": "bad request"}"#), None);
        assert_eq!(duplicate_contact_id("not json"), None);
        let no_meta = r#"{"message": "duplicated contacts"}"#;
        assert_eq!(duplicate_contact_id(no_meta), None);
    }
}
