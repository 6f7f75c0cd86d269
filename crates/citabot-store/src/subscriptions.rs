use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{info, instrument};

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::{PricingTier, SubscriptionRow, SubscriptionStatus};

/// Billing subscription rows plus pricing tiers.
#[derive(Clone)]
pub struct SubscriptionStore {
    db: Db,
}

impl SubscriptionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Idempotent sync from a `customer.subscription.*` webhook: replays
    /// yield identical rows.
    #[instrument(skip(self, row), fields(subscription_id = %row.id))]
    pub fn sync(&self, row: &SubscriptionRow) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO subscriptions
             (id, account_id, customer_id, status, tier_id, current_period_end,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?7)
             ON CONFLICT(id) DO UPDATE SET
               account_id = excluded.account_id,
               customer_id = excluded.customer_id,
               status = excluded.status,
               tier_id = excluded.tier_id,
               current_period_end = excluded.current_period_end,
               updated_at = excluded.updated_at",
            params![
                row.id,
                row.account_id,
                row.customer_id,
                row.status.to_string(),
                row.tier_id,
                row.current_period_end.map(|d| d.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        info!(subscription_id = %row.id, status = %row.status, "synced subscription");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<SubscriptionRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, account_id, customer_id, status, tier_id,
                    current_period_end, created_at, updated_at
             FROM subscriptions WHERE id = ?1",
            params![id],
            row_to_subscription,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn get_by_account(&self, account_id: &str) -> Result<Option<SubscriptionRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, account_id, customer_id, status, tier_id,
                    current_period_end, created_at, updated_at
             FROM subscriptions WHERE account_id = ?1
             ORDER BY updated_at DESC LIMIT 1",
            params![account_id],
            row_to_subscription,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM subscriptions WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Pricing tiers ─────────────────────────────────────────────────────

    pub fn upsert_tier(&self, tier: &PricingTier) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO pricing_tiers
             (id, name, monthly_price, annual_price, monthly_price_id,
              annual_price_id, products)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               monthly_price = excluded.monthly_price,
               annual_price = excluded.annual_price,
               monthly_price_id = excluded.monthly_price_id,
               annual_price_id = excluded.annual_price_id,
               products = excluded.products",
            params![
                tier.id,
                tier.name,
                tier.monthly_price,
                tier.annual_price,
                tier.monthly_price_id,
                tier.annual_price_id,
                serde_json::to_string(&tier.products)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_tier(&self, id: &str) -> Result<Option<PricingTier>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, monthly_price, annual_price, monthly_price_id,
                    annual_price_id, products
             FROM pricing_tiers WHERE id = ?1",
            params![id],
            |row| {
                let products_json: String = row.get(6)?;
                Ok(PricingTier {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    monthly_price: row.get(2)?,
                    annual_price: row.get(3)?,
                    monthly_price_id: row.get(4)?,
                    annual_price_id: row.get(5)?,
                    products: serde_json::from_str(&products_json).unwrap_or_default(),
                })
            },
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Persist a lazily-created processor price id on a tier.
    pub fn set_tier_price_id(&self, id: &str, annual: bool, price_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let sql = if annual {
            "UPDATE pricing_tiers SET annual_price_id = ?1 WHERE id = ?2"
        } else {
            "UPDATE pricing_tiers SET monthly_price_id = ?1 WHERE id = ?2"
        };
        let n = db.execute(sql, params![price_id, id])?;
        if n == 0 {
            return Err(StoreError::not_found("PricingTier", id));
        }
        Ok(())
    }
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    let status_str: String = row.get(3)?;
    let period_end: Option<String> = row.get(5)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(SubscriptionRow {
        id: row.get(0)?,
        account_id: row.get(1)?,
        customer_id: row.get(2)?,
        status: status_str.parse().unwrap_or(SubscriptionStatus::Incomplete),
        tier_id: row.get(4)?,
        current_period_end: period_end.as_deref().map(parse_utc),
        created_at: parse_utc(&created),
        updated_at: parse_utc(&updated),
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

    fn row(id: &str, status: SubscriptionStatus) -> SubscriptionRow {
        SubscriptionRow {
            id: id.into(),
            account_id: "acct-1".into(),
            customer_id: "cus_1".into(),
            status,
            tier_id: Some("tier-basic".into()),
            current_period_end: Some(Utc::now() + chrono::Duration::days(30)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sync_is_idempotent_on_replay() {
        let s = SubscriptionStore::new(open_in_memory().unwrap());
        let r = row("sub_1", SubscriptionStatus::Active);
        s.sync(&r).unwrap();
        s.sync(&r).unwrap();

        let got = s.get("sub_1").unwrap().unwrap();
        assert_eq!(got.status, SubscriptionStatus::Active);
        assert_eq!(got.tier_id.as_deref(), Some("tier-basic"));
    }

    #[test]
    fn status_updates_overwrite() {
        let s = SubscriptionStore::new(open_in_memory().unwrap());
        s.sync(&row("sub_1", SubscriptionStatus::Trialing)).unwrap();
        s.sync(&row("sub_1", SubscriptionStatus::PastDue)).unwrap();
        assert_eq!(
            s.get("sub_1").unwrap().unwrap().status,
            SubscriptionStatus::PastDue
        );
    }

    #[test]
    fn tier_price_ids_fill_lazily() {
        let s = SubscriptionStore::new(open_in_memory().unwrap());
        s.upsert_tier(&PricingTier {
            id: "tier-basic".into(),
            name: "Básico".into(),
            monthly_price: 99_900,
            annual_price: Some(999_000),
            monthly_price_id: None,
            annual_price_id: None,
            products: vec!["whatsapp-bot".into()],
        })
        .unwrap();

        s.set_tier_price_id("tier-basic", false, "price_m1").unwrap();
        let t = s.get_tier("tier-basic").unwrap().unwrap();
        assert_eq!(t.monthly_price_id.as_deref(), Some("price_m1"));
        assert_eq!(t.annual_price_id, None);
    }
}
