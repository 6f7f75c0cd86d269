use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{debug, info, instrument, warn};

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::{Conversation, ConversationStatus};

const COLS: &str = "id, account_id, phone_number, messages, context, status,
                    created_at, updated_at, expires_at";

/// Session-scoped message history, keyed `account_phone[_session_n]`.
#[derive(Clone)]
pub struct ConversationStore {
    db: Db,
    ttl_hours: i64,
    max_messages: usize,
}

impl ConversationStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            ttl_hours: 24,
            max_messages: 100,
        }
    }

    pub fn with_limits(mut self, ttl_hours: i64, max_messages: usize) -> Self {
        self.ttl_hours = ttl_hours;
        self.max_messages = max_messages;
        self
    }

    /// Read a conversation. A row past its expires-at flips to `expired`
    /// and the transition is persisted before returning.
    #[instrument(skip(self))]
    pub fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let mut conversation = {
            let db = self.db.lock().unwrap();
            let sql = format!("SELECT {COLS} FROM conversations WHERE id = ?1");
            match db.query_row(&sql, params![id], row_to_conversation) {
                Ok(c) => c?,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(StoreError::Database(e)),
            }
        };

        if conversation.status == ConversationStatus::Active
            && conversation.is_expired(Utc::now())
        {
            debug!(conversation_id = %id, "conversation expired on read");
            conversation.status = ConversationStatus::Expired;
            self.update(&mut conversation)?;
        }

        Ok(Some(conversation))
    }

    /// Get the active session for (account, canonical phone) or create one.
    ///
    /// When the base-keyed conversation exists but is terminal, a new
    /// session id with an incrementing `_session_n` suffix is allocated so
    /// history is preserved.
    #[instrument(skip(self))]
    pub fn get_or_create(&self, account_id: &str, phone_number: &str) -> Result<Conversation> {
        if let Some(active) = self.find_active(account_id, phone_number)? {
            debug!(conversation_id = %active.id, "reusing active conversation");
            return Ok(active);
        }

        let base_id = format!("{account_id}_{phone_number}");
        let id = match self.get(&base_id)? {
            Some(existing) if existing.status.is_terminal() => {
                let n = self.next_session_number(account_id, phone_number)?;
                let id = format!("{base_id}_session_{}", n.max(2));
                info!(
                    old_id = %base_id,
                    old_status = %existing.status,
                    new_id = %id,
                    "allocating new conversation session"
                );
                id
            }
            Some(existing) => return Ok(existing),
            None => base_id,
        };

        let mut conversation =
            Conversation::new(id, account_id.to_string(), phone_number.to_string());
        conversation.expires_at = Some(Utc::now() + Duration::hours(self.ttl_hours));
        conversation.context.phone_number = Some(phone_number.to_string());
        self.insert(&conversation)?;
        Ok(conversation)
    }

    fn insert(&self, c: &Conversation) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations
             (id, account_id, phone_number, messages, context, status,
              created_at, updated_at, expires_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                c.id,
                c.account_id,
                c.phone_number,
                serde_json::to_string(&c.messages)?,
                serde_json::to_string(&c.context)?,
                c.status.to_string(),
                c.created_at.to_rfc3339(),
                c.updated_at.to_rfc3339(),
                c.expires_at.map(|e| e.to_rfc3339()),
            ],
        )?;
        info!(conversation_id = %c.id, account_id = %c.account_id, "created conversation");
        Ok(())
    }

    /// Persist a conversation, truncating the message log from the head
    /// when it exceeds the configured cap.
    #[instrument(skip(self, c), fields(conversation_id = %c.id))]
    pub fn update(&self, c: &mut Conversation) -> Result<()> {
        c.updated_at = Utc::now();

        if c.messages.len() > self.max_messages {
            let overflow = c.messages.len() - self.max_messages;
            c.messages.drain(..overflow);
            warn!(
                conversation_id = %c.id,
                message_count = c.messages.len(),
                "message limit reached, truncated from head"
            );
        }

        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations
             SET messages = ?1, context = ?2, status = ?3, updated_at = ?4,
                 expires_at = ?5
             WHERE id = ?6",
            params![
                serde_json::to_string(&c.messages)?,
                serde_json::to_string(&c.context)?,
                c.status.to_string(),
                c.updated_at.to_rfc3339(),
                c.expires_at.map(|e| e.to_rfc3339()),
                c.id,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("Conversation", c.id.clone()));
        }
        Ok(())
    }

    /// Most recent active, non-expired conversation for the pair.
    pub fn find_active(
        &self,
        account_id: &str,
        phone_number: &str,
    ) -> Result<Option<Conversation>> {
        let rows = {
            let db = self.db.lock().unwrap();
            let sql = format!(
                "SELECT {COLS} FROM conversations
                 WHERE account_id = ?1 AND phone_number = ?2 AND status = 'active'
                 ORDER BY updated_at DESC"
            );
            let mut stmt = db.prepare(&sql)?;
            let rows: Vec<_> = stmt
                .query_map(params![account_id, phone_number], row_to_conversation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let now = Utc::now();
        for r in rows {
            let c = r?;
            if !c.is_expired(now) {
                return Ok(Some(c));
            }
        }
        Ok(None)
    }

    /// All conversations under a pair, regardless of status. Used by the
    /// delete CLI and session numbering.
    pub fn list_for_phone(&self, account_id: &str, phone_number: &str) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {COLS} FROM conversations
             WHERE account_id = ?1 AND phone_number = ?2
             ORDER BY created_at"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows: Vec<_> = stmt
            .query_map(params![account_id, phone_number], row_to_conversation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().collect()
    }

    fn next_session_number(&self, account_id: &str, phone_number: &str) -> Result<i64> {
        let mut highest = 1i64;
        for c in self.list_for_phone(account_id, phone_number)? {
            if let Some(part) = c.id.rsplit("_session_").next() {
                if c.id.contains("_session_") {
                    if let Ok(n) = part.parse::<i64>() {
                        highest = highest.max(n);
                    }
                }
            }
        }
        Ok(highest + 1)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::not_found("Conversation", id));
        }
        info!(conversation_id = %id, "deleted conversation");
        Ok(())
    }

    /// Remove conversations past their expiry. Returns the count removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM conversations WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if n > 0 {
            info!(count = n, "cleaned up expired conversations");
        }
        Ok(n)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Conversation>> {
    let messages_json: String = row.get(3)?;
    let context_json: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    let expires: Option<String> = row.get(8)?;

    Ok((|| {
        Ok(Conversation {
            id: row.get(0)?,
            account_id: row.get(1)?,
            phone_number: row.get(2)?,
            messages: serde_json::from_str(&messages_json)?,
            context: serde_json::from_str(&context_json)?,
            status: status_str.parse().unwrap_or(ConversationStatus::Active),
            created_at: parse_rfc3339(&created),
            updated_at: parse_rfc3339(&updated),
            expires_at: expires.as_deref().map(parse_rfc3339),
        })
    })())
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::types::MessageRole;
    use std::collections::HashMap;

    fn store() -> ConversationStore {
        ConversationStore::new(open_in_memory().unwrap()).with_limits(24, 5)
    }

    #[test]
    fn get_or_create_reuses_active_session() {
        let s = store();
        let c1 = s.get_or_create("acct", "5213319858734").unwrap();
        let c2 = s.get_or_create("acct", "5213319858734").unwrap();
        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.id, "acct_5213319858734");
    }

    #[test]
    fn terminal_conversation_spawns_numbered_session() {
        let s = store();
        let mut c = s.get_or_create("acct", "521333").unwrap();
        c.status = ConversationStatus::Completed;
        s.update(&mut c).unwrap();

        let c2 = s.get_or_create("acct", "521333").unwrap();
        assert_eq!(c2.id, "acct_521333_session_2");
        assert_eq!(c2.status, ConversationStatus::Active);

        let mut c2 = c2;
        c2.status = ConversationStatus::Cancelled;
        s.update(&mut c2).unwrap();

        let c3 = s.get_or_create("acct", "521333").unwrap();
        assert_eq!(c3.id, "acct_521333_session_3");
    }

    #[test]
    fn message_log_truncates_from_head() {
        let s = store();
        let mut c = s.get_or_create("acct", "521333").unwrap();
        for i in 0..9 {
            c.add_message(MessageRole::User, format!("m{i}"), HashMap::new());
        }
        s.update(&mut c).unwrap();
        assert_eq!(c.messages.len(), 5);
        assert_eq!(c.messages[0].content, "m4");

        let read_back = s.get(&c.id).unwrap().unwrap();
        assert_eq!(read_back.messages.len(), 5);
        assert_eq!(read_back.messages.last().unwrap().content, "m8");
    }

    #[test]
    fn expired_conversation_transitions_on_read() {
        let s = store();
        let mut c = s.get_or_create("acct", "521333").unwrap();
        c.expires_at = Some(Utc::now() - Duration::hours(1));
        s.update(&mut c).unwrap();

        let read = s.get(&c.id).unwrap().unwrap();
        assert_eq!(read.status, ConversationStatus::Expired);

        // The transition is persisted, so a new session gets allocated.
        let fresh = s.get_or_create("acct", "521333").unwrap();
        assert_ne!(fresh.id, c.id);
    }

    #[test]
    fn context_round_trips_contact_id() {
        let s = store();
        let mut c = s.get_or_create("acct", "521333").unwrap();
        c.context.set_contact_id("ghl-contact-9");
        c.context.awaiting_confirmation = true;
        s.update(&mut c).unwrap();

        let read = s.get(&c.id).unwrap().unwrap();
        assert_eq!(read.context.contact_id(), Some("ghl-contact-9"));
        assert!(read.context.awaiting_confirmation);
    }

    #[test]
    fn cleanup_removes_only_expired_rows() {
        let s = store();
        let mut c1 = s.get_or_create("acct", "521111").unwrap();
        c1.expires_at = Some(Utc::now() - Duration::hours(2));
        s.update(&mut c1).unwrap();
        let _c2 = s.get_or_create("acct", "521222").unwrap();

        assert_eq!(s.cleanup_expired().unwrap(), 1);
        assert!(s.get(&c1.id).unwrap().is_none());
        assert!(s.get("acct_521222").unwrap().is_some());
    }
}
