use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::Result;

/// Shared connection handle. Every store wraps a clone of this; SQLite in
/// WAL mode serializes writers, the mutex serializes statement use.
pub type Db = Arc<Mutex<Connection>>;

/// Initialise every table and index.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id                    TEXT PRIMARY KEY,
            name                  TEXT NOT NULL,
            email                 TEXT,
            phone_number_id       TEXT NOT NULL,
            calendar_id           TEXT NOT NULL,
            location_id           TEXT NOT NULL,
            assigned_user_id      TEXT NOT NULL,
            custom_prompt         TEXT,
            status                TEXT NOT NULL DEFAULT 'active',
            payments              TEXT NOT NULL,
            subscription          TEXT NOT NULL,
            metadata              TEXT NOT NULL DEFAULT '{}',
            created_at            TEXT NOT NULL,
            updated_at            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_accounts_phone_number_id
            ON accounts(phone_number_id);
        CREATE INDEX IF NOT EXISTS idx_accounts_email
            ON accounts(email);

        CREATE TABLE IF NOT EXISTS conversations (
            id            TEXT PRIMARY KEY,
            account_id    TEXT NOT NULL,
            phone_number  TEXT NOT NULL,
            messages      TEXT NOT NULL DEFAULT '[]',
            context       TEXT NOT NULL DEFAULT '{}',
            status        TEXT NOT NULL DEFAULT 'active',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            expires_at    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_phone
            ON conversations(phone_number, status);
        CREATE INDEX IF NOT EXISTS idx_conversations_account
            ON conversations(account_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS bookings (
            id                 TEXT PRIMARY KEY,
            doctor_id          TEXT NOT NULL,
            patient            TEXT NOT NULL,
            appointment_at     TEXT NOT NULL,
            appointment_date   TEXT NOT NULL,
            appointment_time   TEXT NOT NULL,
            source             TEXT NOT NULL,
            status             TEXT NOT NULL DEFAULT 'pending',
            payment_required   INTEGER NOT NULL DEFAULT 0,
            payment_id         TEXT,
            payment_status     TEXT,
            appointment_id     TEXT,
            calendar_id        TEXT,
            contact_id         TEXT,
            doctor_name        TEXT,
            location           TEXT,
            specialty          TEXT,
            consultation_price INTEGER,
            confirmed_at       TEXT,
            metadata           TEXT NOT NULL DEFAULT '{}',
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_bookings_doctor
            ON bookings(doctor_id, appointment_at);
        CREATE INDEX IF NOT EXISTS idx_bookings_phone
            ON bookings(json_extract(patient, '$.phone'), created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_bookings_source
            ON bookings(source);

        CREATE TABLE IF NOT EXISTS payments (
            id              TEXT PRIMARY KEY,
            account_id      TEXT NOT NULL,
            conversation_id TEXT,
            booking_id      TEXT,
            amount          INTEGER NOT NULL,
            currency        TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            checkout_url    TEXT NOT NULL,
            customer_name   TEXT,
            customer_phone  TEXT,
            appointment_id  TEXT,
            source          TEXT NOT NULL,
            expires_at      TEXT,
            metadata        TEXT NOT NULL DEFAULT '{}',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processed_messages (
            account_id   TEXT NOT NULL,
            message_id   TEXT NOT NULL,
            phone_number TEXT,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (account_id, message_id)
        );

        CREATE TABLE IF NOT EXISTS tokens (
            account_id    TEXT PRIMARY KEY,
            access_token  TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_type    TEXT NOT NULL DEFAULT 'Bearer',
            scope         TEXT,
            location_id   TEXT,
            expires_at    INTEGER NOT NULL,
            expires_in    INTEGER NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS oauth_states (
            state      TEXT PRIMARY KEY,
            account_id TEXT,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS appointment_reminders (
            appointment_id   TEXT PRIMARY KEY,
            contact_id       TEXT NOT NULL,
            contact_phone    TEXT NOT NULL,
            appointment_time TEXT NOT NULL,
            sent_at          TEXT NOT NULL,
            account_id       TEXT NOT NULL,
            location_id      TEXT,
            calendar_id      TEXT
        );

        CREATE TABLE IF NOT EXISTS active_reminder_contexts (
            id             TEXT PRIMARY KEY,
            phone_number   TEXT NOT NULL,
            appointment_id TEXT NOT NULL,
            account_id     TEXT NOT NULL,
            location_id    TEXT,
            created_at     TEXT NOT NULL,
            expires_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reminder_contexts_phone
            ON active_reminder_contexts(phone_number, expires_at DESC);

        CREATE TABLE IF NOT EXISTS directory_profiles (
            id                 TEXT PRIMARY KEY,
            account_id         TEXT NOT NULL,
            enabled            INTEGER NOT NULL DEFAULT 0,
            full_name          TEXT NOT NULL,
            specialty          TEXT,
            photo_url          TEXT,
            credentials        TEXT NOT NULL DEFAULT '[]',
            consultation_price INTEGER,
            languages          TEXT NOT NULL DEFAULT '[]',
            latitude           REAL,
            longitude          REAL,
            office_address     TEXT,
            schedule           TEXT,
            rating             REAL,
            rating_count       INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_directory_specialty
            ON directory_profiles(specialty, enabled);

        CREATE TABLE IF NOT EXISTS subscriptions (
            id                 TEXT PRIMARY KEY,
            account_id         TEXT NOT NULL,
            customer_id        TEXT NOT NULL,
            status             TEXT NOT NULL,
            tier_id            TEXT,
            current_period_end TEXT,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_account
            ON subscriptions(account_id);

        CREATE TABLE IF NOT EXISTS pricing_tiers (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL,
            monthly_price    INTEGER NOT NULL,
            annual_price     INTEGER,
            monthly_price_id TEXT,
            annual_price_id  TEXT,
            products         TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS reminder_job_runs (
            id                 TEXT PRIMARY KEY,
            started_at         TEXT NOT NULL,
            timezone           TEXT NOT NULL,
            total_accounts     INTEGER NOT NULL,
            total_appointments INTEGER NOT NULL,
            reminders_sent     INTEGER NOT NULL,
            errors             TEXT NOT NULL DEFAULT '[]'
        );",
    )?;
    Ok(())
}

/// Open (or create) the database file and run migrations.
pub fn open(path: &str) -> Result<Db> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Every store, opened over one shared connection.
#[derive(Clone)]
pub struct Stores {
    pub accounts: crate::accounts::AccountStore,
    pub conversations: crate::conversations::ConversationStore,
    pub bookings: crate::bookings::BookingStore,
    pub payments: crate::payments::PaymentStore,
    pub dedup: crate::dedup::DedupStore,
    pub tokens: crate::tokens::TokenStore,
    pub reminders: crate::reminders::ReminderStore,
    pub directory: crate::directory::DirectoryStore,
    pub subscriptions: crate::subscriptions::SubscriptionStore,
}

impl Stores {
    pub fn new(db: Db) -> Self {
        Self {
            accounts: crate::accounts::AccountStore::new(db.clone()),
            conversations: crate::conversations::ConversationStore::new(db.clone()),
            bookings: crate::bookings::BookingStore::new(db.clone()),
            payments: crate::payments::PaymentStore::new(db.clone()),
            dedup: crate::dedup::DedupStore::new(db.clone()),
            tokens: crate::tokens::TokenStore::new(db.clone()),
            reminders: crate::reminders::ReminderStore::new(db.clone()),
            directory: crate::directory::DirectoryStore::new(db.clone()),
            subscriptions: crate::subscriptions::SubscriptionStore::new(db),
        }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open(path)?))
    }
}
