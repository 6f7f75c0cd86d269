use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{info, instrument};

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::{PaymentRecord, PaymentStatus};

const COLS: &str = "id, account_id, conversation_id, booking_id, amount,
                    currency, status, checkout_url, customer_name,
                    customer_phone, appointment_id, source, expires_at,
                    metadata, created_at, updated_at";

/// Payment rows created alongside checkout sessions.
#[derive(Clone)]
pub struct PaymentStore {
    db: Db,
}

impl PaymentStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id))]
    pub fn insert(&self, payment: &PaymentRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO payments
             (id, account_id, conversation_id, booking_id, amount, currency,
              status, checkout_url, customer_name, customer_phone,
              appointment_id, source, expires_at, metadata, created_at,
              updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?15)",
            params![
                payment.id,
                payment.account_id,
                payment.conversation_id,
                payment.booking_id,
                payment.amount,
                payment.currency,
                payment.status.to_string(),
                payment.checkout_url,
                payment.customer_name,
                payment.customer_phone,
                payment.appointment_id,
                payment.source,
                payment.expires_at.map(|d| d.to_rfc3339()),
                serde_json::to_string(&payment.metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        info!(payment_id = %payment.id, amount = payment.amount, "recorded payment");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<PaymentRecord>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {COLS} FROM payments WHERE id = ?1");
        match db.query_row(&sql, params![id], row_to_payment) {
            Ok(p) => Ok(Some(p?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Update status; optionally stamp the CRM appointment id on success.
    #[instrument(skip(self))]
    pub fn update_status(
        &self,
        id: &str,
        status: PaymentStatus,
        appointment_id: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE payments
             SET status = ?1,
                 appointment_id = COALESCE(?2, appointment_id),
                 updated_at = ?3
             WHERE id = ?4",
            params![status.to_string(), appointment_id, Utc::now().to_rfc3339(), id],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("Payment", id));
        }
        Ok(())
    }
}

fn row_to_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<PaymentRecord>> {
    let status_str: String = row.get(6)?;
    let expires: Option<String> = row.get(12)?;
    let metadata_json: String = row.get(13)?;
    let created: String = row.get(14)?;
    let updated: String = row.get(15)?;

    Ok((|| {
        Ok(PaymentRecord {
            id: row.get(0)?,
            account_id: row.get(1)?,
            conversation_id: row.get(2)?,
            booking_id: row.get(3)?,
            amount: row.get(4)?,
            currency: row.get(5)?,
            status: status_str.parse().unwrap_or(PaymentStatus::Pending),
            checkout_url: row.get(7)?,
            customer_name: row.get(8)?,
            customer_phone: row.get(9)?,
            appointment_id: row.get(10)?,
            source: row.get(11)?,
            expires_at: expires.as_deref().map(parse_utc),
            metadata: serde_json::from_str::<HashMap<_, _>>(&metadata_json).unwrap_or_default(),
            created_at: parse_utc(&created),
            updated_at: parse_utc(&updated),
        })
    })())
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

    fn payment(id: &str) -> PaymentRecord {
        PaymentRecord {
            id: id.into(),
            account_id: "acct-1".into(),
            conversation_id: Some("acct-1_521333".into()),
            booking_id: Some("book-1".into()),
            amount: 50_000,
            currency: "mxn".into(),
            status: PaymentStatus::Pending,
            checkout_url: "https://checkout.example.com/s/1".into(),
            customer_name: Some("Juan Pérez".into()),
            customer_phone: Some("5213319858734".into()),
            appointment_id: None,
            source: "chat".into(),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(30)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn insert_and_get() {
        let s = PaymentStore::new(open_in_memory().unwrap());
        s.insert(&payment("pay-1")).unwrap();
        let p = s.get("pay-1").unwrap().unwrap();
        assert_eq!(p.amount, 50_000);
        assert_eq!(p.status, PaymentStatus::Pending);
        assert!(p.expires_at.is_some());
    }

    #[test]
    fn success_stamps_appointment_id_once() {
        let s = PaymentStore::new(open_in_memory().unwrap());
        s.insert(&payment("pay-1")).unwrap();

        s.update_status("pay-1", PaymentStatus::Completed, Some("appt-9")).unwrap();
        let p = s.get("pay-1").unwrap().unwrap();
        assert_eq!(p.status, PaymentStatus::Completed);
        assert_eq!(p.appointment_id.as_deref(), Some("appt-9"));

        // A later status-only update must not clear the appointment link.
        s.update_status("pay-1", PaymentStatus::Completed, None).unwrap();
        let p = s.get("pay-1").unwrap().unwrap();
        assert_eq!(p.appointment_id.as_deref(), Some("appt-9"));
    }
}
