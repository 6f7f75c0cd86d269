//! Daily reminder batch: fan out over active tenants, send one reminder
//! per appointment, open a 24-hour reply context per patient phone.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use citabot_core::phone::normalize_phone;
use citabot_crm::types::CalendarEvent;
use citabot_crm::CrmClient;
use citabot_store::types::{Account, ReminderRunStats, ReminderSent};
use citabot_store::Stores;
use citabot_whatsapp::templates;
use citabot_whatsapp::WhatsAppClient;
use tracing::{error, info, instrument, warn};

pub struct ReminderDispatcher {
    stores: Stores,
    crm: CrmClient,
    whatsapp: WhatsAppClient,
}

impl ReminderDispatcher {
    pub fn new(stores: Stores, crm: CrmClient, whatsapp: WhatsAppClient) -> Self {
        Self {
            stores,
            crm,
            whatsapp,
        }
    }

    /// Run the daily batch for every active tenant. Per-tenant and
    /// per-appointment failures are collected, never propagated — one bad
    /// tenant must not starve the rest.
    #[instrument(skip(self), fields(%timezone, dry_run))]
    pub async fn run_daily(&self, timezone: Tz, dry_run: bool) -> ReminderRunStats {
        info!("starting daily reminder batch");
        let started_at = Utc::now();
        let mut stats = ReminderRunStats::default();

        let accounts = match self.stores.accounts.list(Some("active")) {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "account listing failed");
                stats.errors.push(format!("Fatal error: {e}"));
                return stats;
            }
        };
        stats.total_accounts = accounts.len() as u32;

        for account in &accounts {
            if let Err(e) = self
                .process_account(account, timezone, dry_run, &mut stats)
                .await
            {
                let message = format!("Error processing account {}: {e}", account.id);
                error!(account_id = %account.id, error = %e, "account batch failed");
                stats.errors.push(message);
            }
        }

        info!(
            accounts = stats.total_accounts,
            appointments = stats.total_appointments,
            sent = stats.reminders_sent,
            errors = stats.errors.len(),
            "reminder batch completed"
        );

        if let Err(e) = self
            .stores
            .reminders
            .record_run(started_at, timezone.name(), &stats)
        {
            warn!(error = %e, "failed to persist run stats");
        }
        stats
    }

    async fn process_account(
        &self,
        account: &Account,
        timezone: Tz,
        dry_run: bool,
        stats: &mut ReminderRunStats,
    ) -> Result<(), citabot_crm::CrmError> {
        info!(account_id = %account.id, calendar_id = %account.calendar_id, "processing account reminders");

        let (start_ms, end_ms) = today_window_ms(Utc::now(), timezone);
        let events = self
            .crm
            .get_calendar_events(
                &account.id,
                &account.location_id,
                &account.calendar_id,
                start_ms,
                end_ms,
            )
            .await?;

        let appointments: Vec<&CalendarEvent> =
            events.iter().filter(|e| is_reminder_candidate(e)).collect();
        stats.total_appointments += appointments.len() as u32;

        for event in appointments {
            match self.send_one(account, event, timezone, dry_run).await {
                Ok(true) => stats.reminders_sent += 1,
                Ok(false) => {}
                Err(e) => {
                    let message = format!("Error sending reminder {}: {e}", event.id);
                    warn!(appointment_id = %event.id, error = %e, "reminder send failed");
                    stats.errors.push(message);
                }
            }
        }
        Ok(())
    }

    /// Returns true when a reminder went out for this appointment.
    async fn send_one(
        &self,
        account: &Account,
        event: &CalendarEvent,
        timezone: Tz,
        dry_run: bool,
    ) -> Result<bool, String> {
        let Some(contact_id) = event.contact_id.as_deref() else {
            warn!(appointment_id = %event.id, "appointment has no contact, skipping");
            return Ok(false);
        };

        if self
            .stores
            .reminders
            .already_sent(&event.id)
            .map_err(|e| e.to_string())?
        {
            info!(appointment_id = %event.id, "reminder already sent, skipping");
            return Ok(false);
        }

        let contact = self
            .crm
            .get_contact(&account.id, contact_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("contact {contact_id} not found"))?;

        let Some(raw_phone) = contact.phone.as_deref() else {
            warn!(%contact_id, appointment_id = %event.id, "contact has no phone, skipping");
            return Ok(false);
        };
        let Some(phone) = normalize_phone(raw_phone) else {
            warn!(%contact_id, "contact phone did not normalize, skipping");
            return Ok(false);
        };

        let start = event
            .start_time
            .as_deref()
            .and_then(parse_event_time)
            .ok_or_else(|| format!("appointment {} has no usable startTime", event.id))?;
        let local_time = start.with_timezone(&timezone).format("%I:%M %p").to_string();
        let calendar_name = event.title.clone().unwrap_or_default();

        if dry_run {
            info!(
                appointment_id = %event.id,
                %phone,
                %local_time,
                "dry run: reminder not sent"
            );
            return Ok(false);
        }

        let template = templates::reminder_template(
            &phone,
            contact.display_name(),
            &local_time,
            &calendar_name,
        );
        let sent = self
            .whatsapp
            .send_template(&account.phone_number_id, template)
            .await;
        if sent.is_none() {
            return Err(format!(
                "Failed to send reminder for appointment {}",
                event.id
            ));
        }

        // Dedup record and reply context are written together so an
        // immediate patient reply finds the context.
        self.stores
            .reminders
            .mark_sent(&ReminderSent {
                appointment_id: event.id.clone(),
                contact_id: contact_id.to_string(),
                contact_phone: phone.clone(),
                appointment_time: start,
                sent_at: Utc::now(),
                account_id: account.id.clone(),
                location_id: Some(account.location_id.clone()),
                calendar_id: event.calendar_id.clone().or(Some(account.calendar_id.clone())),
            })
            .map_err(|e| e.to_string())?;

        info!(appointment_id = %event.id, %phone, "reminder sent");
        Ok(true)
    }
}

/// Only real, uncancelled appointments get reminders. Blocked slots come
/// back without an appointmentStatus.
pub fn is_reminder_candidate(event: &CalendarEvent) -> bool {
    match event.appointment_status.as_deref() {
        None | Some("") => false,
        Some("cancelled") => false,
        Some(_) => true,
    }
}

/// [00:00, 23:59:59.999] of today in `tz`, as UTC ms-epoch bounds.
pub fn today_window_ms(now: DateTime<Utc>, tz: Tz) -> (i64, i64) {
    let local = now.with_timezone(&tz);
    let start = tz
        .with_ymd_and_hms(local.year(), local.month(), local.day(), 0, 0, 0)
        .single()
        .unwrap_or(local);
    let end = start + Duration::days(1) - Duration::milliseconds(1);
    (start.timestamp_millis(), end.timestamp_millis())
}

/// Appointment start times arrive as RFC 3339, with or without the `Z`.
fn parse_event_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(stripped) = s.strip_suffix('Z') {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(stripped, "%Y-%m-%dT%H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, status: Option<&str>) -> CalendarEvent {
        CalendarEvent {
            id: id.into(),
            title: Some("Consulta general".into()),
            start_time: Some("2025-06-09T16:00:00+00:00".into()),
            end_time: None,
            appointment_status: status.map(String::from),
            contact_id: Some("contact-1".into()),
            calendar_id: Some("cal-1".into()),
        }
    }

    #[test]
    fn candidates_require_a_status_and_exclude_cancelled() {
        assert!(is_reminder_candidate(&event("a", Some("confirmed"))));
        assert!(is_reminder_candidate(&event("b", Some("new"))));
        assert!(!is_reminder_candidate(&event("c", Some("cancelled"))));
        assert!(!is_reminder_candidate(&event("d", None)));
        assert!(!is_reminder_candidate(&event("e", Some(""))));
    }

    #[test]
    fn window_covers_the_local_day() {
        let tz: Tz = "America/Mexico_City".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 9, 15, 0, 0).unwrap();
        let (start, end) = today_window_ms(now, tz);
        assert_eq!(
            start,
            Utc.with_ymd_and_hms(2025, 6, 9, 6, 0, 0).unwrap().timestamp_millis()
        );
        assert_eq!(end - start, 24 * 60 * 60 * 1000 - 1);
    }

    #[test]
    fn event_times_parse_with_and_without_zone() {
        assert!(parse_event_time("2025-06-09T16:00:00+00:00").is_some());
        assert!(parse_event_time("2025-06-09T16:00:00Z").is_some());
        assert!(parse_event_time("not a time").is_none());
    }
}
