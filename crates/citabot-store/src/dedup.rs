use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::{error, info, instrument};

use crate::db::Db;
use crate::error::Result;

/// At-most-once processing of inbound platform messages.
///
/// The claim is a single `INSERT … ON CONFLICT DO NOTHING`, which SQLite
/// executes atomically: of two concurrent deliveries, exactly one inserts.
#[derive(Clone)]
pub struct DedupStore {
    db: Db,
}

impl DedupStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Returns true when the message is new (and is now marked processed),
    /// false when it was already claimed.
    ///
    /// Fails open: a store error returns true so processing continues —
    /// the platform deduplicates on its side as well.
    #[instrument(skip(self))]
    pub fn claim(&self, account_id: &str, message_id: &str, phone_number: &str) -> bool {
        let result = (|| -> Result<bool> {
            let db = self.db.lock().unwrap();
            let n = db.execute(
                "INSERT INTO processed_messages (account_id, message_id, phone_number, processed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, message_id) DO NOTHING",
                params![account_id, message_id, phone_number, Utc::now().to_rfc3339()],
            )?;
            Ok(n == 1)
        })();

        match result {
            Ok(true) => true,
            Ok(false) => {
                info!(%message_id, %account_id, "duplicate message suppressed");
                false
            }
            Err(e) => {
                error!(%message_id, error = %e, "dedup claim failed, failing open");
                true
            }
        }
    }

    /// Periodic sweep: drop claims older than the TTL. Returns rows removed.
    pub fn cleanup(&self, ttl_hours: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::hours(ttl_hours)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM processed_messages WHERE processed_at < ?1",
            params![cutoff],
        )?;
        if n > 0 {
            info!(count = n, "cleaned up processed-message claims");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[test]
    fn claim_is_true_once_then_false() {
        let s = DedupStore::new(open_in_memory().unwrap());
        assert!(s.claim("acct", "wamid.1", "521333"));
        assert!(!s.claim("acct", "wamid.1", "521333"));
        assert!(!s.claim("acct", "wamid.1", "521333"));
    }

    #[test]
    fn claims_are_scoped_per_tenant() {
        let s = DedupStore::new(open_in_memory().unwrap());
        assert!(s.claim("acct-a", "wamid.1", "521333"));
        assert!(s.claim("acct-b", "wamid.1", "521333"));
        assert!(!s.claim("acct-a", "wamid.1", "521333"));
    }

    #[test]
    fn cleanup_respects_ttl() {
        let s = DedupStore::new(open_in_memory().unwrap());
        assert!(s.claim("acct", "old", "521333"));

        // Backdate the row past the TTL.
        {
            let db = s.db.lock().unwrap();
            db.execute(
                "UPDATE processed_messages SET processed_at = ?1 WHERE message_id = 'old'",
                params![(Utc::now() - Duration::hours(5)).to_rfc3339()],
            )
            .unwrap();
        }
        assert!(s.claim("acct", "fresh", "521333"));

        assert_eq!(s.cleanup(2).unwrap(), 1);
        // The swept claim can be taken again.
        assert!(s.claim("acct", "old", "521333"));
        assert!(!s.claim("acct", "fresh", "521333"));
    }
}
