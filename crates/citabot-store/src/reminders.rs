use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::{ActiveReminderContext, ReminderRunStats, ReminderSent};

/// Reminder-sent dedup records, active reply contexts, and job-run stats.
#[derive(Clone)]
pub struct ReminderStore {
    db: Db,
}

impl ReminderStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// True when a reminder was already sent for this CRM appointment.
    pub fn already_sent(&self, appointment_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM appointment_reminders WHERE appointment_id = ?1",
            params![appointment_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Record the sent reminder and open the 24-hour reply context in one
    /// step, so an inbound reply right after the send finds the context.
    #[instrument(skip(self, sent), fields(appointment_id = %sent.appointment_id))]
    pub fn mark_sent(&self, sent: &ReminderSent) -> Result<ActiveReminderContext> {
        let context = ActiveReminderContext {
            id: Uuid::new_v4().to_string(),
            phone_number: sent.contact_phone.clone(),
            appointment_id: sent.appointment_id.clone(),
            account_id: sent.account_id.clone(),
            location_id: sent.location_id.clone(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
        };

        let db = self.db.lock().unwrap();
        let tx = db.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO appointment_reminders
             (appointment_id, contact_id, contact_phone, appointment_time,
              sent_at, account_id, location_id, calendar_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                sent.appointment_id,
                sent.contact_id,
                sent.contact_phone,
                sent.appointment_time.to_rfc3339(),
                sent.sent_at.to_rfc3339(),
                sent.account_id,
                sent.location_id,
                sent.calendar_id,
            ],
        )?;
        tx.execute(
            "INSERT INTO active_reminder_contexts
             (id, phone_number, appointment_id, account_id, location_id,
              created_at, expires_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                context.id,
                context.phone_number,
                context.appointment_id,
                context.account_id,
                context.location_id,
                context.created_at.to_rfc3339(),
                context.expires_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        info!(
            appointment_id = %sent.appointment_id,
            phone = %sent.contact_phone,
            context_id = %context.id,
            "marked reminder sent and opened reply context"
        );
        Ok(context)
    }

    /// Latest non-expired context for a canonical phone, if any.
    pub fn active_context(&self, phone_number: &str) -> Result<Option<ActiveReminderContext>> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, phone_number, appointment_id, account_id, location_id,
                    created_at, expires_at
             FROM active_reminder_contexts
             WHERE phone_number = ?1 AND expires_at > ?2
             ORDER BY created_at DESC LIMIT 1",
            params![phone_number, now],
            row_to_context,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    #[instrument(skip(self))]
    pub fn clear_context(&self, context_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM active_reminder_contexts WHERE id = ?1",
            params![context_id],
        )?;
        Ok(())
    }

    /// Remove every context for a phone — used once a reminder interaction
    /// is resolved.
    #[instrument(skip(self))]
    pub fn clear_contexts_for_phone(&self, phone_number: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM active_reminder_contexts WHERE phone_number = ?1",
            params![phone_number],
        )?;
        Ok(n)
    }

    /// Sweep contexts past their 24-hour expiry.
    pub fn cleanup_expired_contexts(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM active_reminder_contexts WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(n)
    }

    /// Persist a reminder batch's statistics.
    pub fn record_run(
        &self,
        started_at: DateTime<Utc>,
        timezone: &str,
        stats: &ReminderRunStats,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO reminder_job_runs
             (id, started_at, timezone, total_accounts, total_appointments,
              reminders_sent, errors)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                id,
                started_at.to_rfc3339(),
                timezone,
                stats.total_accounts,
                stats.total_appointments,
                stats.reminders_sent,
                serde_json::to_string(&stats.errors)?,
            ],
        )?;
        Ok(id)
    }
}

fn row_to_context(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActiveReminderContext> {
    let created: String = row.get(5)?;
    let expires: String = row.get(6)?;
    Ok(ActiveReminderContext {
        id: row.get(0)?,
        phone_number: row.get(1)?,
        appointment_id: row.get(2)?,
        account_id: row.get(3)?,
        location_id: row.get(4)?,
        created_at: parse_utc(&created),
        expires_at: parse_utc(&expires),
    })
}

fn parse_utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn sent(appointment_id: &str, phone: &str) -> ReminderSent {
        ReminderSent {
            appointment_id: appointment_id.into(),
            contact_id: "contact-1".into(),
            contact_phone: phone.into(),
            appointment_time: Utc::now() + Duration::hours(3),
            sent_at: Utc::now(),
            account_id: "acct-1".into(),
            location_id: Some("loc-1".into()),
            calendar_id: Some("cal-1".into()),
        }
    }

    #[test]
    fn mark_sent_dedups_per_appointment() {
        let s = ReminderStore::new(open_in_memory().unwrap());
        assert!(!s.already_sent("appt-1").unwrap());
        s.mark_sent(&sent("appt-1", "521333")).unwrap();
        assert!(s.already_sent("appt-1").unwrap());
        assert!(!s.already_sent("appt-2").unwrap());
    }

    #[test]
    fn latest_context_wins() {
        let s = ReminderStore::new(open_in_memory().unwrap());
        s.mark_sent(&sent("appt-1", "521333")).unwrap();
        let second = s.mark_sent(&sent("appt-2", "521333")).unwrap();

        let active = s.active_context("521333").unwrap().unwrap();
        assert_eq!(active.appointment_id, "appt-2");
        assert_eq!(active.id, second.id);
    }

    #[test]
    fn expired_contexts_are_invisible_and_sweepable() {
        let s = ReminderStore::new(open_in_memory().unwrap());
        let ctx = s.mark_sent(&sent("appt-1", "521333")).unwrap();

        {
            let db = s.db.lock().unwrap();
            db.execute(
                "UPDATE active_reminder_contexts SET expires_at = ?1 WHERE id = ?2",
                params![(Utc::now() - Duration::hours(1)).to_rfc3339(), ctx.id],
            )
            .unwrap();
        }

        assert!(s.active_context("521333").unwrap().is_none());
        assert_eq!(s.cleanup_expired_contexts().unwrap(), 1);
    }

    #[test]
    fn clearing_by_phone_removes_every_context() {
        let s = ReminderStore::new(open_in_memory().unwrap());
        s.mark_sent(&sent("appt-1", "521333")).unwrap();
        s.mark_sent(&sent("appt-2", "521333")).unwrap();
        s.mark_sent(&sent("appt-3", "521444")).unwrap();

        assert_eq!(s.clear_contexts_for_phone("521333").unwrap(), 2);
        assert!(s.active_context("521333").unwrap().is_none());
        assert!(s.active_context("521444").unwrap().is_some());
    }

    #[test]
    fn run_stats_persist() {
        let s = ReminderStore::new(open_in_memory().unwrap());
        let stats = ReminderRunStats {
            total_accounts: 3,
            total_appointments: 7,
            reminders_sent: 6,
            errors: vec!["acct-2: contact missing phone".into()],
        };
        let id = s.record_run(Utc::now(), "America/Mexico_City", &stats).unwrap();
        assert!(!id.is_empty());
    }
}
