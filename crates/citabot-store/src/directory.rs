use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::instrument;

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::types::DirectoryProfile;

const COLS: &str = "id, account_id, enabled, full_name, specialty, photo_url,
                    credentials, consultation_price, languages, latitude,
                    longitude, office_address, schedule, rating, rating_count,
                    created_at, updated_at";

/// Public doctor-directory listings.
#[derive(Clone)]
pub struct DirectoryStore {
    db: Db,
}

impl DirectoryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[instrument(skip(self, profile), fields(profile_id = %profile.id))]
    pub fn upsert(&self, profile: &DirectoryProfile) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO directory_profiles
             (id, account_id, enabled, full_name, specialty, photo_url,
              credentials, consultation_price, languages, latitude, longitude,
              office_address, schedule, rating, rating_count, created_at,
              updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?16)
             ON CONFLICT(id) DO UPDATE SET
               account_id = excluded.account_id,
               enabled = excluded.enabled,
               full_name = excluded.full_name,
               specialty = excluded.specialty,
               photo_url = excluded.photo_url,
               credentials = excluded.credentials,
               consultation_price = excluded.consultation_price,
               languages = excluded.languages,
               latitude = excluded.latitude,
               longitude = excluded.longitude,
               office_address = excluded.office_address,
               schedule = excluded.schedule,
               rating = excluded.rating,
               rating_count = excluded.rating_count,
               updated_at = excluded.updated_at",
            params![
                profile.id,
                profile.account_id,
                profile.enabled as i64,
                profile.full_name,
                profile.specialty,
                profile.photo_url,
                serde_json::to_string(&profile.credentials)?,
                profile.consultation_price,
                serde_json::to_string(&profile.languages)?,
                profile.latitude,
                profile.longitude,
                profile.office_address,
                profile.schedule.as_ref().map(|s| s.to_string()),
                profile.rating,
                profile.rating_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<DirectoryProfile>> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {COLS} FROM directory_profiles WHERE id = ?1");
        match db.query_row(&sql, params![id], row_to_profile) {
            Ok(p) => Ok(Some(p?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Enabled profiles, optionally filtered by specialty and a geo radius.
    /// Radius filtering happens in memory with a haversine distance — the
    /// directory is small enough that an R-tree is not worth carrying.
    pub fn search(
        &self,
        specialty: Option<&str>,
        near: Option<(f64, f64, f64)>,
    ) -> Result<Vec<DirectoryProfile>> {
        let rows = {
            let db = self.db.lock().unwrap();
            let mut out = Vec::new();
            match specialty {
                Some(s) => {
                    let sql = format!(
                        "SELECT {COLS} FROM directory_profiles
                         WHERE enabled = 1 AND specialty = ?1
                         ORDER BY rating DESC NULLS LAST"
                    );
                    let mut stmt = db.prepare(&sql)?;
                    let rows = stmt.query_map(params![s], row_to_profile)?;
                    for r in rows {
                        out.push(r??);
                    }
                }
                None => {
                    let sql = format!(
                        "SELECT {COLS} FROM directory_profiles
                         WHERE enabled = 1
                         ORDER BY rating DESC NULLS LAST"
                    );
                    let mut stmt = db.prepare(&sql)?;
                    let rows = stmt.query_map([], row_to_profile)?;
                    for r in rows {
                        out.push(r??);
                    }
                }
            }
            out
        };

        let filtered = match near {
            Some((lat, lng, radius_km)) => rows
                .into_iter()
                .filter(|p| match (p.latitude, p.longitude) {
                    (Some(plat), Some(plng)) => {
                        haversine_km(lat, lng, plat, plng) <= radius_km
                    }
                    _ => false,
                })
                .collect(),
            None => rows,
        };
        Ok(filtered)
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<DirectoryProfile>> {
    let credentials_json: String = row.get(6)?;
    let languages_json: String = row.get(8)?;
    let schedule_json: Option<String> = row.get(12)?;
    let created: String = row.get(15)?;
    let updated: String = row.get(16)?;

    Ok((|| {
        Ok(DirectoryProfile {
            id: row.get(0)?,
            account_id: row.get(1)?,
            enabled: row.get::<_, i64>(2)? != 0,
            full_name: row.get(3)?,
            specialty: row.get(4)?,
            photo_url: row.get(5)?,
            credentials: serde_json::from_str(&credentials_json).unwrap_or_default(),
            consultation_price: row.get(7)?,
            languages: serde_json::from_str(&languages_json).unwrap_or_default(),
            latitude: row.get(9)?,
            longitude: row.get(10)?,
            office_address: row.get(11)?,
            schedule: schedule_json.and_then(|s| serde_json::from_str(&s).ok()),
            rating: row.get(13)?,
            rating_count: row.get(14)?,
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

    fn profile(id: &str, specialty: &str, lat: f64, lng: f64) -> DirectoryProfile {
        DirectoryProfile {
            id: id.into(),
            account_id: format!("acct-{id}"),
            enabled: true,
            full_name: format!("Dr. {id}"),
            specialty: Some(specialty.into()),
            photo_url: None,
            credentials: vec!["UNAM".into()],
            consultation_price: Some(50_000),
            languages: vec!["es".into()],
            latitude: Some(lat),
            longitude: Some(lng),
            office_address: Some("Av. Siempre Viva 742".into()),
            schedule: None,
            rating: Some(4.5),
            rating_count: 12,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn search_filters_specialty_and_radius() {
        let s = DirectoryStore::new(open_in_memory().unwrap());
        // Guadalajara centre and a profile ~550 km away in CDMX.
        s.upsert(&profile("gdl", "cardiology", 20.6597, -103.3496)).unwrap();
        s.upsert(&profile("cdmx", "cardiology", 19.4326, -99.1332)).unwrap();
        s.upsert(&profile("derm", "dermatology", 20.6597, -103.3496)).unwrap();

        let cardio = s.search(Some("cardiology"), None).unwrap();
        assert_eq!(cardio.len(), 2);

        let nearby = s
            .search(Some("cardiology"), Some((20.6597, -103.3496, 50.0)))
            .unwrap();
        assert_eq!(nearby.len(), 1);
        assert_eq!(nearby[0].id, "gdl");
    }

    #[test]
    fn disabled_profiles_are_hidden() {
        let s = DirectoryStore::new(open_in_memory().unwrap());
        let mut p = profile("off", "cardiology", 20.0, -103.0);
        p.enabled = false;
        s.upsert(&p).unwrap();
        assert!(s.search(None, None).unwrap().is_empty());
        // Direct lookup still works for admin flows.
        assert!(s.get("off").unwrap().is_some());
    }

    #[test]
    fn haversine_sanity() {
        // GDL → CDMX is roughly 460 km.
        let d = haversine_km(20.6597, -103.3496, 19.4326, -99.1332);
        assert!(d > 400.0 && d < 520.0, "distance was {d}");
    }
}
