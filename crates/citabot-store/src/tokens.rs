use chrono::Utc;
use rusqlite::params;
use tracing::{info, instrument};

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::TokenRow;

/// Per-tenant OAuth tokens. One row per account.
#[derive(Clone)]
pub struct TokenStore {
    db: Db,
}

/// A full token response from the CRM's OAuth endpoint.
#[derive(Debug, Clone)]
pub struct TokenPayload {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub scope: Option<String>,
    pub location_id: Option<String>,
    pub expires_in: i64,
}

impl TokenStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Persist a complete token response (initial grant or a rotation).
    /// Both access and refresh tokens come from the same response, so the
    /// single-row write keeps them paired.
    #[instrument(skip(self, payload))]
    pub fn save(&self, account_id: &str, payload: &TokenPayload) -> Result<()> {
        let now = Utc::now();
        let expires_at = now.timestamp() + payload.expires_in;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tokens
             (account_id, access_token, refresh_token, token_type, scope,
              location_id, expires_at, expires_in, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?9)
             ON CONFLICT(account_id) DO UPDATE SET
               access_token  = excluded.access_token,
               refresh_token = excluded.refresh_token,
               token_type    = excluded.token_type,
               scope         = excluded.scope,
               location_id   = COALESCE(excluded.location_id, tokens.location_id),
               expires_at    = excluded.expires_at,
               expires_in    = excluded.expires_in,
               updated_at    = excluded.updated_at",
            params![
                account_id,
                payload.access_token,
                payload.refresh_token,
                payload.token_type,
                payload.scope,
                payload.location_id,
                expires_at,
                payload.expires_in,
                now.to_rfc3339(),
            ],
        )?;
        info!(%account_id, "saved tokens");
        Ok(())
    }

    pub fn get(&self, account_id: &str) -> Result<Option<TokenRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT account_id, access_token, refresh_token, token_type, scope,
                    location_id, expires_at, expires_in, created_at, updated_at
             FROM tokens WHERE account_id = ?1",
            params![account_id],
            row_to_token,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Refresh response carried no new refresh token: replace only the
    /// access token and its absolute expiry. The old refresh token stays.
    #[instrument(skip(self, access_token))]
    pub fn update_access_token(
        &self,
        account_id: &str,
        access_token: &str,
        expires_in: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now.timestamp() + expires_in;
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE tokens
             SET access_token = ?1, expires_in = ?2, expires_at = ?3, updated_at = ?4
             WHERE account_id = ?5",
            params![access_token, expires_in, expires_at, now.to_rfc3339(), account_id],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("Token", account_id));
        }
        info!(%account_id, "updated access token");
        Ok(())
    }

    pub fn delete(&self, account_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM tokens WHERE account_id = ?1", params![account_id])?;
        if n == 0 {
            return Err(StoreError::not_found("Token", account_id));
        }
        info!(%account_id, "deleted tokens");
        Ok(())
    }

    /// Expired (or missing) means a refresh is required before the next
    /// outbound CRM call.
    pub fn is_expired(&self, account_id: &str) -> Result<bool> {
        match self.get(account_id)? {
            Some(row) => Ok(row.is_expired(Utc::now().timestamp())),
            None => Ok(true),
        }
    }

    // ── OAuth install states ──────────────────────────────────────────────

    /// Issue a one-hour state nonce for the authorize redirect.
    pub fn create_oauth_state(&self, account_id: Option<&str>) -> Result<String> {
        let state = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO oauth_states (state, account_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                state,
                account_id,
                now.to_rfc3339(),
                (now + chrono::Duration::hours(1)).to_rfc3339(),
            ],
        )?;
        Ok(state)
    }

    /// Validate and delete a state nonce. Returns the account id bound to
    /// it, or `None` when the state is unknown or expired.
    pub fn consume_oauth_state(&self, state: &str) -> Result<Option<Option<String>>> {
        let db = self.db.lock().unwrap();
        let row: Option<(Option<String>, String)> = match db.query_row(
            "SELECT account_id, expires_at FROM oauth_states WHERE state = ?1",
            params![state],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(r) => Some(r),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(StoreError::Database(e)),
        };
        db.execute("DELETE FROM oauth_states WHERE state = ?1", params![state])?;

        match row {
            Some((account_id, expires_at)) => {
                let expired = chrono::DateTime::parse_from_rfc3339(&expires_at)
                    .map(|e| Utc::now() > e.with_timezone(&Utc))
                    .unwrap_or(true);
                if expired {
                    Ok(None)
                } else {
                    Ok(Some(account_id))
                }
            }
            None => Ok(None),
        }
    }
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRow> {
    let created: String = row.get(8)?;
    let updated: String = row.get(9)?;
    Ok(TokenRow {
        account_id: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        token_type: row.get(3)?,
        scope: row.get(4)?,
        location_id: row.get(5)?,
        expires_at: row.get(6)?,
        expires_in: row.get(7)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn payload(access: &str, refresh: &str) -> TokenPayload {
        TokenPayload {
            access_token: access.into(),
            refresh_token: refresh.into(),
            token_type: "Bearer".into(),
            scope: Some("contacts calendars".into()),
            location_id: Some("loc-1".into()),
            expires_in: 3600,
        }
    }

    #[test]
    fn save_then_get_round_trips() {
        let s = TokenStore::new(open_in_memory().unwrap());
        s.save("acct", &payload("at-1", "rt-1")).unwrap();
        let row = s.get("acct").unwrap().unwrap();
        assert_eq!(row.access_token, "at-1");
        assert_eq!(row.refresh_token, "rt-1");
        assert!(row.expires_at > Utc::now().timestamp());
        assert!(!s.is_expired("acct").unwrap());
    }

    #[test]
    fn rotation_replaces_both_tokens_together() {
        let s = TokenStore::new(open_in_memory().unwrap());
        s.save("acct", &payload("at-1", "rt-1")).unwrap();
        s.save("acct", &payload("at-2", "rt-2")).unwrap();

        let row = s.get("acct").unwrap().unwrap();
        assert_eq!(row.access_token, "at-2");
        assert_eq!(row.refresh_token, "rt-2");
    }

    #[test]
    fn access_only_update_preserves_refresh_token() {
        let s = TokenStore::new(open_in_memory().unwrap());
        s.save("acct", &payload("at-1", "rt-1")).unwrap();
        s.update_access_token("acct", "at-2", 7200).unwrap();

        let row = s.get("acct").unwrap().unwrap();
        assert_eq!(row.access_token, "at-2");
        assert_eq!(row.refresh_token, "rt-1");
        assert_eq!(row.expires_in, 7200);
    }

    #[test]
    fn missing_row_counts_as_expired() {
        let s = TokenStore::new(open_in_memory().unwrap());
        assert!(s.is_expired("nobody").unwrap());
        assert!(s.update_access_token("nobody", "at", 60).is_err());
    }

    #[test]
    fn expired_when_past_absolute_expiry() {
        let s = TokenStore::new(open_in_memory().unwrap());
        let mut p = payload("at-1", "rt-1");
        p.expires_in = -10;
        s.save("acct", &p).unwrap();
        assert!(s.is_expired("acct").unwrap());
    }

    #[test]
    fn oauth_state_is_single_use() {
        let s = TokenStore::new(open_in_memory().unwrap());
        let state = s.create_oauth_state(Some("acct")).unwrap();

        let consumed = s.consume_oauth_state(&state).unwrap();
        assert_eq!(consumed, Some(Some("acct".to_string())));

        // Second use fails: the row is gone.
        assert_eq!(s.consume_oauth_state(&state).unwrap(), None);
        assert_eq!(s.consume_oauth_state("bogus").unwrap(), None);
    }
}
