use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;
use tracing::{info, instrument};

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::{Account, PaymentsBlock, SubscriptionBlock};

const COLS: &str = "id, name, email, phone_number_id, calendar_id, location_id,
                    assigned_user_id, custom_prompt, status, payments,
                    subscription, metadata, created_at, updated_at";

/// Tenant records. The payments and subscription blocks live as JSON
/// documents inside the row.
#[derive(Clone)]
pub struct AccountStore {
    db: Db,
}

impl AccountStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[instrument(skip(self, account), fields(account_id = %account.id))]
    pub fn upsert(&self, account: &Account) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO accounts
             (id, name, email, phone_number_id, calendar_id, location_id,
              assigned_user_id, custom_prompt, status, payments, subscription,
              metadata, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               email = excluded.email,
               phone_number_id = excluded.phone_number_id,
               calendar_id = excluded.calendar_id,
               location_id = excluded.location_id,
               assigned_user_id = excluded.assigned_user_id,
               custom_prompt = excluded.custom_prompt,
               status = excluded.status,
               payments = excluded.payments,
               subscription = excluded.subscription,
               metadata = excluded.metadata,
               updated_at = excluded.updated_at",
            params![
                account.id,
                account.name,
                account.email,
                account.phone_number_id,
                account.calendar_id,
                account.location_id,
                account.assigned_user_id,
                account.custom_prompt,
                account.status.to_string(),
                serde_json::to_string(&account.payments)?,
                serde_json::to_string(&account.subscription)?,
                serde_json::to_string(&account.metadata)?,
                account.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Account>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {COLS} FROM accounts WHERE id = ?1");
        match db.query_row(&sql, params![id], row_to_account) {
            Ok(a) => Ok(Some(a?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Tenant lookup for inbound webhooks: by WhatsApp business phone id.
    pub fn get_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Account>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {COLS} FROM accounts WHERE phone_number_id = ?1");
        match db.query_row(&sql, params![phone_number_id], row_to_account) {
            Ok(a) => Ok(Some(a?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Match used by `account.updated` payment webhooks.
    pub fn get_by_email(&self, email: &str) -> Result<Option<Account>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {COLS} FROM accounts WHERE email = ?1");
        match db.query_row(&sql, params![email], row_to_account) {
            Ok(a) => Ok(Some(a?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Match by persisted connected-account id, for webhooks that arrive
    /// while hosted onboarding is still in progress.
    pub fn get_by_connected_account(&self, connected_account_id: &str) -> Result<Option<Account>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {COLS} FROM accounts
             WHERE json_extract(payments, '$.connected_account_id') = ?1"
        );
        match db.query_row(&sql, params![connected_account_id], row_to_account) {
            Ok(a) => Ok(Some(a?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Match by billing customer id, for subscription webhook sync.
    pub fn get_by_billing_customer(&self, customer_id: &str) -> Result<Option<Account>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {COLS} FROM accounts
             WHERE json_extract(subscription, '$.customer_id') = ?1"
        );
        match db.query_row(&sql, params![customer_id], row_to_account) {
            Ok(a) => Ok(Some(a?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Account>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {COLS} FROM accounts WHERE name = ?1");
        match db.query_row(&sql, params![name], row_to_account) {
            Ok(a) => Ok(Some(a?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn list(&self, status: Option<&str>) -> Result<Vec<Account>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let sql = format!("SELECT {COLS} FROM accounts WHERE status = ?1 ORDER BY created_at");
                let mut stmt = db.prepare(&sql)?;
                let rows = stmt.query_map(params![s], row_to_account)?;
                for r in rows {
                    out.push(r??);
                }
            }
            None => {
                let sql = format!("SELECT {COLS} FROM accounts ORDER BY created_at");
                let mut stmt = db.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_account)?;
                for r in rows {
                    out.push(r??);
                }
            }
        }
        Ok(out)
    }

    /// Replace only the payments block (webhook-driven capability updates).
    #[instrument(skip(self, payments))]
    pub fn update_payments(&self, id: &str, payments: &PaymentsBlock) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE accounts SET payments = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(payments)?,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("Account", id));
        }
        info!(account_id = %id, "updated payments block");
        Ok(())
    }

    /// Replace only the subscription block (billing webhook sync).
    #[instrument(skip(self, subscription))]
    pub fn update_subscription(&self, id: &str, subscription: &SubscriptionBlock) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE accounts SET subscription = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(subscription)?,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("Account", id));
        }
        Ok(())
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Account>> {
    let payments_json: String = row.get(9)?;
    let subscription_json: String = row.get(10)?;
    let metadata_json: String = row.get(11)?;
    let status_str: String = row.get(8)?;
    let created: String = row.get(12)?;
    let updated: String = row.get(13)?;

    Ok((|| {
        Ok(Account {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone_number_id: row.get(3)?,
            calendar_id: row.get(4)?,
            location_id: row.get(5)?,
            assigned_user_id: row.get(6)?,
            custom_prompt: row.get(7)?,
            status: status_str.parse().unwrap_or(crate::types::AccountStatus::Inactive),
            payments: serde_json::from_str(&payments_json)?,
            subscription: serde_json::from_str(&subscription_json)?,
            metadata: serde_json::from_str::<HashMap<_, _>>(&metadata_json).unwrap_or_default(),
            created_at: chrono::DateTime::parse_from_rfc3339(&created)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: chrono::DateTime::parse_from_rfc3339(&updated)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::types::AccountStatus;

    fn sample(id: &str, phone_number_id: &str) -> Account {
        Account {
            id: id.into(),
            name: format!("Consultorio {id}"),
            email: Some(format!("{id}@example.com")),
            phone_number_id: phone_number_id.into(),
            calendar_id: "cal-1".into(),
            location_id: "loc-1".into(),
            assigned_user_id: "user-1".into(),
            custom_prompt: None,
            status: AccountStatus::Active,
            payments: PaymentsBlock {
                appointment_price: 50_000,
                currency: "mxn".into(),
                description: "Pago de consulta médica".into(),
                ..Default::default()
            },
            subscription: SubscriptionBlock::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn upsert_and_lookup_by_phone_number_id() {
        let store = AccountStore::new(open_in_memory().unwrap());
        store.upsert(&sample("a1", "pnid-1")).unwrap();
        store.upsert(&sample("a2", "pnid-2")).unwrap();

        let a = store.get_by_phone_number_id("pnid-2").unwrap().unwrap();
        assert_eq!(a.id, "a2");
        assert_eq!(a.payments.appointment_price, 50_000);
        assert!(store.get_by_phone_number_id("pnid-9").unwrap().is_none());
    }

    #[test]
    fn connected_account_match_uses_payments_block() {
        let store = AccountStore::new(open_in_memory().unwrap());
        let mut a = sample("a1", "pnid-1");
        a.payments.connected_account_id = Some("acct_stripe_1".into());
        store.upsert(&a).unwrap();

        let found = store.get_by_connected_account("acct_stripe_1").unwrap();
        assert_eq!(found.unwrap().id, "a1");
        assert!(store.get_by_connected_account("acct_other").unwrap().is_none());
    }

    #[test]
    fn update_payments_persists_flags() {
        let store = AccountStore::new(open_in_memory().unwrap());
        let a = sample("a1", "pnid-1");
        store.upsert(&a).unwrap();

        let mut block = a.payments.clone();
        block.enabled = true;
        block.charges_enabled = true;
        block.details_submitted = true;
        block.onboarding_completed = true;
        store.update_payments("a1", &block).unwrap();

        let got = store.get("a1").unwrap().unwrap();
        assert!(got.payments.charges_enabled);
        assert!(got.payments.onboarding_completed);
    }

    #[test]
    fn list_filters_by_status() {
        let store = AccountStore::new(open_in_memory().unwrap());
        let mut a = sample("a1", "p1");
        store.upsert(&a).unwrap();
        a = sample("a2", "p2");
        a.status = AccountStatus::Suspended;
        store.upsert(&a).unwrap();

        assert_eq!(store.list(Some("active")).unwrap().len(), 1);
        assert_eq!(store.list(None).unwrap().len(), 2);
    }
}
