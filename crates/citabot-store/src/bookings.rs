use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::{Booking, BookingSource, BookingStatus, PatientInfo, PaymentStatus};

const COLS: &str = "id, doctor_id, patient, appointment_at, appointment_date,
                    appointment_time, source, status, payment_required,
                    payment_id, payment_status, appointment_id, calendar_id,
                    contact_id, doctor_name, location, specialty,
                    consultation_price, confirmed_at, metadata, created_at,
                    updated_at";

/// Parameters for a new booking record.
pub struct NewBooking {
    pub doctor_id: String,
    pub patient: PatientInfo,
    pub appointment_at: DateTime<Utc>,
    pub appointment_date: String,
    pub appointment_time: String,
    pub source: BookingSource,
    pub payment_required: bool,
    pub calendar_id: Option<String>,
    pub doctor_name: Option<String>,
    pub location: Option<String>,
    pub specialty: Option<String>,
    pub consultation_price: Option<i64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Unified booking records for both channels.
#[derive(Clone)]
pub struct BookingStore {
    db: Db,
}

impl BookingStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(doctor_id = %new.doctor_id, source = %new.source))]
    pub fn create(&self, new: NewBooking) -> Result<Booking> {
        let now = Utc::now();
        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            doctor_id: new.doctor_id,
            patient: new.patient,
            appointment_at: new.appointment_at,
            appointment_date: new.appointment_date,
            appointment_time: new.appointment_time,
            source: new.source,
            status: BookingStatus::Pending,
            payment_required: new.payment_required,
            payment_id: None,
            payment_status: new.payment_required.then_some(PaymentStatus::Pending),
            appointment_id: None,
            calendar_id: new.calendar_id,
            contact_id: None,
            doctor_name: new.doctor_name,
            location: new.location,
            specialty: new.specialty,
            consultation_price: new.consultation_price,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
            metadata: new.metadata,
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO bookings
             (id, doctor_id, patient, appointment_at, appointment_date,
              appointment_time, source, status, payment_required, payment_id,
              payment_status, appointment_id, calendar_id, contact_id,
              doctor_name, location, specialty, consultation_price,
              confirmed_at, metadata, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,
                     ?17,?18,?19,?20,?21,?21)",
            params![
                booking.id,
                booking.doctor_id,
                serde_json::to_string(&booking.patient)?,
                booking.appointment_at.to_rfc3339(),
                booking.appointment_date,
                booking.appointment_time,
                booking.source.to_string(),
                booking.status.to_string(),
                booking.payment_required as i64,
                booking.payment_id,
                booking.payment_status.map(|s| s.to_string()),
                booking.appointment_id,
                booking.calendar_id,
                booking.contact_id,
                booking.doctor_name,
                booking.location,
                booking.specialty,
                booking.consultation_price,
                booking.confirmed_at.map(|d| d.to_rfc3339()),
                serde_json::to_string(&booking.metadata)?,
                now.to_rfc3339(),
            ],
        )?;
        info!(booking_id = %booking.id, source = %booking.source, "created booking");
        Ok(booking)
    }

    pub fn get(&self, id: &str) -> Result<Option<Booking>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {COLS} FROM bookings WHERE id = ?1");
        match db.query_row(&sql, params![id], row_to_booking) {
            Ok(b) => Ok(Some(b?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    #[instrument(skip(self))]
    pub fn set_status(&self, id: &str, status: BookingStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE bookings SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), Utc::now().to_rfc3339(), id],
        )?;
        require_row(n, id)
    }

    /// Attach a payment id and its status.
    #[instrument(skip(self))]
    pub fn link_payment(&self, id: &str, payment_id: &str, status: PaymentStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE bookings
             SET payment_id = ?1, payment_status = ?2, updated_at = ?3
             WHERE id = ?4",
            params![payment_id, status.to_string(), Utc::now().to_rfc3339(), id],
        )?;
        require_row(n, id)
    }

    #[instrument(skip(self))]
    pub fn set_payment_status(&self, id: &str, status: PaymentStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE bookings SET payment_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), Utc::now().to_rfc3339(), id],
        )?;
        require_row(n, id)
    }

    /// Attach the CRM appointment id and mark the booking confirmed.
    #[instrument(skip(self))]
    pub fn link_appointment(&self, id: &str, appointment_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE bookings
             SET appointment_id = ?1, status = 'confirmed', confirmed_at = ?2,
                 updated_at = ?2
             WHERE id = ?3",
            params![appointment_id, now, id],
        )?;
        require_row(n, id)
    }

    #[instrument(skip(self))]
    pub fn set_contact(&self, id: &str, contact_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE bookings SET contact_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![contact_id, Utc::now().to_rfc3339(), id],
        )?;
        require_row(n, id)
    }

    pub fn cancel(&self, id: &str, reason: Option<&str>) -> Result<()> {
        match reason {
            Some(reason) => {
                let db = self.db.lock().unwrap();
                let n = db.execute(
                    "UPDATE bookings
                     SET status = 'cancelled',
                         metadata = json_set(metadata, '$.cancellation_reason', ?1),
                         updated_at = ?2
                     WHERE id = ?3",
                    params![reason, Utc::now().to_rfc3339(), id],
                )?;
                require_row(n, id)
            }
            None => self.set_status(id, BookingStatus::Cancelled),
        }
    }

    pub fn complete(&self, id: &str) -> Result<()> {
        self.set_status(id, BookingStatus::Completed)
    }

    pub fn mark_no_show(&self, id: &str) -> Result<()> {
        self.set_status(id, BookingStatus::NoShow)
    }

    /// Listing for analytics: by patient phone, newest first.
    pub fn list_by_phone(&self, phone: &str, limit: usize) -> Result<Vec<Booking>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {COLS} FROM bookings
             WHERE json_extract(patient, '$.phone') = ?1
             ORDER BY created_at DESC LIMIT ?2"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows: Vec<_> = stmt
            .query_map(params![phone, limit as i64], row_to_booking)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().collect()
    }

    /// Listing by doctor with optional source and instant-range filters.
    pub fn list_by_doctor(
        &self,
        doctor_id: &str,
        source: Option<BookingSource>,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<Booking>> {
        let db = self.db.lock().unwrap();
        let mut sql = format!("SELECT {COLS} FROM bookings WHERE doctor_id = ?1");
        let mut args: Vec<String> = vec![doctor_id.to_string()];
        if let Some(src) = source {
            sql.push_str(" AND source = ?2");
            args.push(src.to_string());
        }
        if let Some((start, end)) = range {
            let base = args.len();
            sql.push_str(&format!(
                " AND appointment_at >= ?{} AND appointment_at <= ?{}",
                base + 1,
                base + 2
            ));
            args.push(start.to_rfc3339());
            args.push(end.to_rfc3339());
        }
        sql.push_str(" ORDER BY appointment_at");

        let mut stmt = db.prepare(&sql)?;
        let rows: Vec<_> = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_booking)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().collect()
    }

}

fn require_row(n: usize, id: &str) -> Result<()> {
    if n == 0 {
        return Err(StoreError::not_found("Booking", id));
    }
    Ok(())
}

fn row_to_booking(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Booking>> {
    let patient_json: String = row.get(2)?;
    let appointment_at: String = row.get(3)?;
    let source_str: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let payment_status: Option<String> = row.get(10)?;
    let confirmed_at: Option<String> = row.get(18)?;
    let metadata_json: String = row.get(19)?;
    let created: String = row.get(20)?;
    let updated: String = row.get(21)?;

    Ok((|| {
        Ok(Booking {
            id: row.get(0)?,
            doctor_id: row.get(1)?,
            patient: serde_json::from_str(&patient_json)?,
            appointment_at: parse_utc(&appointment_at),
            appointment_date: row.get(4)?,
            appointment_time: row.get(5)?,
            source: source_str.parse().unwrap_or(BookingSource::Chat),
            status: status_str.parse().unwrap_or(BookingStatus::Pending),
            payment_required: row.get::<_, i64>(8)? != 0,
            payment_id: row.get(9)?,
            payment_status: payment_status.and_then(|s| s.parse().ok()),
            appointment_id: row.get(11)?,
            calendar_id: row.get(12)?,
            contact_id: row.get(13)?,
            doctor_name: row.get(14)?,
            location: row.get(15)?,
            specialty: row.get(16)?,
            consultation_price: row.get(17)?,
            confirmed_at: confirmed_at.as_deref().map(parse_utc),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
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

    fn new_booking(source: BookingSource, payment_required: bool) -> NewBooking {
        NewBooking {
            doctor_id: "acct-1".into(),
            patient: PatientInfo {
                name: "Juan Pérez".into(),
                phone: "5213319858734".into(),
                email: Some("juan@example.com".into()),
                reason: Some("dolor de espalda".into()),
            },
            appointment_at: Utc::now() + chrono::Duration::days(1),
            appointment_date: "lunes, 25 de julio de 2025".into(),
            appointment_time: "10:00 a.m.".into(),
            source,
            payment_required,
            calendar_id: Some("cal-1".into()),
            doctor_name: Some("Dra. García".into()),
            location: Some("Av. Siempre Viva 742".into()),
            specialty: None,
            consultation_price: payment_required.then_some(50_000),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn create_sets_pending_and_payment_status() {
        let s = BookingStore::new(open_in_memory().unwrap());
        let paid = s.create(new_booking(BookingSource::Chat, true)).unwrap();
        assert_eq!(paid.status, BookingStatus::Pending);
        assert_eq!(paid.payment_status, Some(PaymentStatus::Pending));

        let free = s.create(new_booking(BookingSource::Directory, false)).unwrap();
        assert_eq!(free.payment_status, None);
    }

    #[test]
    fn link_appointment_confirms_and_stamps() {
        let s = BookingStore::new(open_in_memory().unwrap());
        let b = s.create(new_booking(BookingSource::Chat, false)).unwrap();
        let before = s.get(&b.id).unwrap().unwrap().updated_at;

        s.link_appointment(&b.id, "ghl-appt-1").unwrap();
        let got = s.get(&b.id).unwrap().unwrap();
        assert_eq!(got.status, BookingStatus::Confirmed);
        assert_eq!(got.appointment_id.as_deref(), Some("ghl-appt-1"));
        assert!(got.confirmed_at.is_some());
        assert!(got.updated_at >= before);
    }

    #[test]
    fn payment_invariant_holds_through_helpers() {
        let s = BookingStore::new(open_in_memory().unwrap());
        let b = s.create(new_booking(BookingSource::Chat, true)).unwrap();

        s.link_payment(&b.id, "pay-1", PaymentStatus::Pending).unwrap();
        let got = s.get(&b.id).unwrap().unwrap();
        // Pending payment, so no CRM appointment may exist yet.
        assert!(got.appointment_id.is_none());

        s.set_payment_status(&b.id, PaymentStatus::Completed).unwrap();
        s.link_appointment(&b.id, "ghl-appt-1").unwrap();
        let got = s.get(&b.id).unwrap().unwrap();
        assert_eq!(got.payment_status, Some(PaymentStatus::Completed));
        assert!(got.appointment_id.is_some());
    }

    #[test]
    fn cancel_records_reason_in_metadata() {
        let s = BookingStore::new(open_in_memory().unwrap());
        let b = s.create(new_booking(BookingSource::Directory, false)).unwrap();
        s.cancel(&b.id, Some("patient request")).unwrap();
        let got = s.get(&b.id).unwrap().unwrap();
        assert_eq!(got.status, BookingStatus::Cancelled);
        assert_eq!(
            got.metadata.get("cancellation_reason").and_then(|v| v.as_str()),
            Some("patient request")
        );
    }

    #[test]
    fn listings_filter_by_phone_doctor_and_source() {
        let s = BookingStore::new(open_in_memory().unwrap());
        s.create(new_booking(BookingSource::Chat, false)).unwrap();
        s.create(new_booking(BookingSource::Directory, false)).unwrap();

        let by_phone = s.list_by_phone("5213319858734", 10).unwrap();
        assert_eq!(by_phone.len(), 2);

        let chat_only = s
            .list_by_doctor("acct-1", Some(BookingSource::Chat), None)
            .unwrap();
        assert_eq!(chat_only.len(), 1);

        let in_range = s
            .list_by_doctor(
                "acct-1",
                None,
                Some((Utc::now(), Utc::now() + chrono::Duration::days(2))),
            )
            .unwrap();
        assert_eq!(in_range.len(), 2);
    }

    #[test]
    fn no_show_and_complete_transitions() {
        let s = BookingStore::new(open_in_memory().unwrap());
        let b = s.create(new_booking(BookingSource::Chat, false)).unwrap();
        s.mark_no_show(&b.id).unwrap();
        assert_eq!(s.get(&b.id).unwrap().unwrap().status, BookingStatus::NoShow);
        s.complete(&b.id).unwrap();
        assert_eq!(s.get(&b.id).unwrap().unwrap().status, BookingStatus::Completed);
    }
}
