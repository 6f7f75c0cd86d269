//! Slot availability resolution against the CRM's free- and blocked-slot
//! sources.

use chrono::{DateTime, Datelike, TimeZone};
use chrono_tz::Tz;
use citabot_core::config::RACE_CHECK_MINUTES;
use citabot_crm::types::{CalendarEvent, FreeSlot};
use citabot_crm::CrmClient;
use citabot_store::types::{Account, AvailabilityBlock, SlotOption};
use tracing::{info, instrument, warn};

/// Alternatives offered in any outcome are capped here.
pub const MAX_ALTERNATIVES: usize = 5;
/// Forward search window when the requested day has nothing free.
pub const SEARCH_DAYS: i64 = 7;

/// Outcome of an availability check.
#[derive(Debug, Clone)]
pub enum Availability {
    /// Requested slot is free; alternatives are same-day options starting
    /// with the exact one.
    Exact { alternatives: Vec<SlotOption> },
    /// Requested day has free slots, but not at the requested time.
    SameDateAlternatives { alternatives: Vec<SlotOption> },
    /// Nothing free on the requested day; next-available within 7 days.
    OtherDateAlternatives { alternatives: Vec<SlotOption> },
    /// Nothing free in the whole search window.
    None,
    /// Token refresh failed — surface "contact the administrator" and stop.
    AuthFailed,
}

impl Availability {
    /// Projection persisted on the conversation draft.
    pub fn to_block(&self) -> AvailabilityBlock {
        match self {
            Availability::Exact { alternatives } => AvailabilityBlock {
                available: true,
                exact_match: true,
                slots_for_date: true,
                alternatives: alternatives.clone(),
                error: None,
                message: None,
            },
            Availability::SameDateAlternatives { alternatives } => AvailabilityBlock {
                available: true,
                exact_match: false,
                slots_for_date: true,
                alternatives: alternatives.clone(),
                error: None,
                message: None,
            },
            Availability::OtherDateAlternatives { alternatives } => AvailabilityBlock {
                available: false,
                exact_match: false,
                slots_for_date: false,
                alternatives: alternatives.clone(),
                error: None,
                message: Some("No hay horarios disponibles para la fecha solicitada".into()),
            },
            Availability::None => AvailabilityBlock {
                available: false,
                exact_match: false,
                slots_for_date: false,
                alternatives: Vec::new(),
                error: None,
                message: Some("No hay horarios disponibles para la fecha solicitada".into()),
            },
            Availability::AuthFailed => AvailabilityBlock {
                available: false,
                exact_match: false,
                slots_for_date: false,
                alternatives: Vec::new(),
                error: Some("authentication_failed".into()),
                message: Some(crate::messages::AUTH_FAILED_MESSAGE.into()),
            },
        }
    }
}

/// Check availability for the requested instant.
///
/// Window: start of the requested day in the tenant timezone, plus 24
/// hours. Same-date vs other-date partitioning happens strictly in
/// tenant-local dates.
#[instrument(skip(crm, account), fields(account_id = %account.id))]
pub async fn check(
    crm: &CrmClient,
    account: &Account,
    tz: Tz,
    requested: DateTime<Tz>,
) -> Availability {
    let day_start = tz
        .with_ymd_and_hms(
            requested.year(),
            requested.month(),
            requested.day(),
            0,
            0,
            0,
        )
        .single()
        .unwrap_or(requested);
    let start_ms = day_start.timestamp_millis();
    let end_ms = start_ms + 24 * 60 * 60 * 1000;

    let free_slots = match crm
        .get_free_slots(
            &account.id,
            &account.calendar_id,
            start_ms,
            end_ms,
            tz.name(),
            Some(&account.assigned_user_id),
        )
        .await
    {
        Ok(slots) => slots,
        Err(e) if e.is_auth() => {
            warn!(error = %e, "availability check hit auth failure");
            return Availability::AuthFailed;
        }
        Err(e) => {
            warn!(error = %e, "free-slot fetch failed, searching forward");
            return forward_search(crm, account, tz, requested).await;
        }
    };

    if free_slots.is_empty() {
        return forward_search(crm, account, tz, requested).await;
    }

    let requested_date = requested.format("%Y-%m-%d").to_string();
    let requested_time = requested.format("%H:%M").to_string();

    let options = to_slot_options(&free_slots, tz);
    let (same_date, _other_date) = partition_by_date(&options, &requested_date);

    info!(
        total = options.len(),
        same_date = same_date.len(),
        %requested_date,
        "slot analysis"
    );

    if exact_match(&free_slots, &requested_date, &requested_time) {
        Availability::Exact {
            alternatives: options.into_iter().take(MAX_ALTERNATIVES).collect(),
        }
    } else if !same_date.is_empty() {
        Availability::SameDateAlternatives {
            alternatives: same_date.into_iter().take(MAX_ALTERNATIVES).collect(),
        }
    } else {
        // The CRM returned slots outside the requested window; treat the
        // day as full and search forward.
        forward_search(crm, account, tz, requested).await
    }
}

async fn forward_search(
    crm: &CrmClient,
    account: &Account,
    tz: Tz,
    requested: DateTime<Tz>,
) -> Availability {
    match find_alternative_slots(crm, account, tz, requested, SEARCH_DAYS).await {
        Ok(alternatives) if !alternatives.is_empty() => {
            Availability::OtherDateAlternatives { alternatives }
        }
        Ok(_) => Availability::None,
        Err(e) if e.is_auth() => Availability::AuthFailed,
        Err(e) => {
            warn!(error = %e, "alternative search failed");
            Availability::None
        }
    }
}

/// Next free slots within `days` of the original instant, capped at five.
pub async fn find_alternative_slots(
    crm: &CrmClient,
    account: &Account,
    tz: Tz,
    original: DateTime<Tz>,
    days: i64,
) -> Result<Vec<SlotOption>, citabot_crm::CrmError> {
    let start_ms = original.timestamp_millis();
    let end_ms = start_ms + days * 24 * 60 * 60 * 1000;

    let free_slots = crm
        .get_free_slots(
            &account.id,
            &account.calendar_id,
            start_ms,
            end_ms,
            tz.name(),
            Some(&account.assigned_user_id),
        )
        .await?;

    Ok(to_slot_options(&free_slots, tz)
        .into_iter()
        .take(MAX_ALTERNATIVES)
        .collect())
}

/// Blocked-slot revalidation at a transition boundary: true when an event
/// in the race-check window starts at the requested tenant-local time.
/// Runs before reserving and again after payment succeeds.
#[instrument(skip(crm, account), fields(account_id = %account.id))]
pub async fn slot_taken(
    crm: &CrmClient,
    account: &Account,
    tz: Tz,
    requested: DateTime<Tz>,
) -> bool {
    let start_ms = requested.timestamp_millis();
    let end_ms = start_ms + RACE_CHECK_MINUTES * 60 * 1000;

    let blocked = crm
        .get_blocked_slots(
            &account.id,
            &account.location_id,
            Some(&account.calendar_id),
            Some(&account.assigned_user_id),
            start_ms,
            end_ms,
        )
        .await;

    let requested_time = requested.format("%H:%M").to_string();
    event_starts_at(&blocked, tz, &requested_time)
}

/// Whether any event's start, rendered tenant-local, equals `HH:MM`.
pub fn event_starts_at(events: &[CalendarEvent], tz: Tz, time: &str) -> bool {
    for event in events {
        let Some(start) = event.start_time.as_deref() else {
            continue;
        };
        match DateTime::parse_from_rfc3339(start) {
            Ok(dt) => {
                if dt.with_timezone(&tz).format("%H:%M").to_string() == time {
                    return true;
                }
            }
            Err(e) => {
                warn!(start_time = %start, error = %e, "unparseable blocked-slot start");
            }
        }
    }
    false
}

/// Exact-match test against the normalized free-slot list.
pub fn exact_match(slots: &[FreeSlot], date: &str, time: &str) -> bool {
    slots.iter().any(|s| s.date == date && s.time == time)
}

/// Split options into same-tenant-local-date vs everything else.
pub fn partition_by_date(
    options: &[SlotOption],
    requested_date: &str,
) -> (Vec<SlotOption>, Vec<SlotOption>) {
    let mut same = Vec::new();
    let mut other = Vec::new();
    for option in options {
        if option.date == requested_date {
            same.push(option.clone());
        } else {
            other.push(option.clone());
        }
    }
    (same, other)
}

/// Convert normalized free slots into display options. Slots whose
/// datetime does not parse are skipped.
pub fn to_slot_options(slots: &[FreeSlot], tz: Tz) -> Vec<SlotOption> {
    slots
        .iter()
        .filter_map(|slot| {
            let local = citabot_agent::extract::parse_local_datetime(&slot.datetime, tz)?;
            let (display_date, display_time) = format_spanish(local);
            Some(SlotOption {
                datetime: local.to_rfc3339(),
                display_date,
                display_time,
                date: local.format("%Y-%m-%d").to_string(),
                time: local.format("%H:%M").to_string(),
            })
        })
        .collect()
}

const SPANISH_MONTHS: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// Spanish display forms: "9 de junio de 2025" and "02:00 PM".
pub fn format_spanish<T: TimeZone>(dt: DateTime<T>) -> (String, String)
where
    T::Offset: std::fmt::Display,
{
    let date = format!(
        "{} de {} de {}",
        dt.day(),
        SPANISH_MONTHS[dt.month0() as usize],
        dt.year()
    );
    let time = dt.format("%I:%M %p").to_string();
    (date, time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tz() -> Tz {
        "America/Mexico_City".parse().unwrap()
    }

    fn slot(date: &str, time: &str) -> FreeSlot {
        FreeSlot {
            date: date.into(),
            time: time.into(),
            datetime: format!("{date}T{time}:00"),
        }
    }

    #[test]
    fn exact_match_requires_both_date_and_time() {
        let slots = vec![slot("2025-06-09", "10:00"), slot("2025-06-09", "11:00")];
        assert!(exact_match(&slots, "2025-06-09", "10:00"));
        assert!(!exact_match(&slots, "2025-06-09", "09:00"));
        assert!(!exact_match(&slots, "2025-06-10", "10:00"));
    }

    #[test]
    fn partition_is_strict_on_local_date() {
        let options = to_slot_options(
            &[
                slot("2025-06-09", "10:00"),
                slot("2025-06-09", "11:00"),
                slot("2025-06-10", "09:00"),
            ],
            tz(),
        );
        let (same, other) = partition_by_date(&options, "2025-06-09");
        assert_eq!(same.len(), 2);
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].date, "2025-06-10");
    }

    #[test]
    fn slot_options_format_spanish_display() {
        let options = to_slot_options(&[slot("2025-06-09", "14:00")], tz());
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].display_date, "9 de junio de 2025");
        assert_eq!(options[0].display_time, "02:00 PM");
        assert_eq!(options[0].time, "14:00");
    }

    #[test]
    fn unparseable_slots_are_skipped() {
        let bad = FreeSlot {
            date: "2025-06-09".into(),
            time: "??".into(),
            datetime: "garbage".into(),
        };
        let options = to_slot_options(&[bad, slot("2025-06-09", "10:00")], tz());
        assert_eq!(options.len(), 1);
    }

    #[test]
    fn blocked_event_matches_on_local_time() {
        // 20:00Z is 14:00 in Mexico City (UTC-6).
        let events = vec![CalendarEvent {
            id: "evt-1".into(),
            title: Some("Bloqueo".into()),
            start_time: Some("2025-06-09T20:00:00+00:00".into()),
            end_time: None,
            appointment_status: None,
            contact_id: None,
            calendar_id: None,
        }];
        assert!(event_starts_at(&events, tz(), "14:00"));
        assert!(!event_starts_at(&events, tz(), "15:00"));
    }

    #[test]
    fn malformed_blocked_events_do_not_match() {
        let events = vec![CalendarEvent {
            id: "evt-1".into(),
            title: None,
            start_time: Some("not-a-date".into()),
            end_time: None,
            appointment_status: None,
            contact_id: None,
            calendar_id: None,
        }];
        assert!(!event_starts_at(&events, tz(), "14:00"));
    }

    #[test]
    fn availability_projections_carry_flags() {
        let options = to_slot_options(&[slot("2025-06-09", "10:00")], tz());

        let exact = Availability::Exact {
            alternatives: options.clone(),
        }
        .to_block();
        assert!(exact.available && exact.exact_match);

        let same_date = Availability::SameDateAlternatives {
            alternatives: options.clone(),
        }
        .to_block();
        assert!(same_date.available && !same_date.exact_match && same_date.slots_for_date);

        let other = Availability::OtherDateAlternatives {
            alternatives: options,
        }
        .to_block();
        assert!(!other.available && !other.slots_for_date);

        let auth = Availability::AuthFailed.to_block();
        assert_eq!(auth.error.as_deref(), Some("authentication_failed"));
    }
}
