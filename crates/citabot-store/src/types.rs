//! Domain records persisted by the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ── Accounts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

impl FromStr for AccountStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "inactive" => Ok(AccountStatus::Inactive),
            "suspended" => Ok(AccountStatus::Suspended),
            other => Err(format!("unknown account status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Payment-processor state for an account (Connect-style connected account).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentsBlock {
    pub enabled: bool,
    pub connected_account_id: Option<String>,
    pub onboarding_completed: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub capability_status: Option<String>,
    pub last_webhook_at: Option<DateTime<Utc>>,
    /// Consultation price in minor units.
    pub appointment_price: i64,
    pub currency: String,
    pub description: String,
}

/// Platform-billing state for an account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionBlock {
    pub customer_id: Option<String>,
    pub tier_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub is_free_account: bool,
    pub free_account_reason: Option<String>,
    pub free_account_expires: Option<DateTime<Utc>>,
    pub products_override: Option<Vec<String>>,
}

/// One tenant: a business with a WhatsApp phone id and a CRM calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone_number_id: String,
    pub calendar_id: String,
    pub location_id: String,
    pub assigned_user_id: String,
    pub custom_prompt: Option<String>,
    pub status: AccountStatus,
    pub payments: PaymentsBlock,
    pub subscription: SubscriptionBlock,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Payments may be attempted only when the connected account exists,
    /// onboarding finished, and charges are live.
    pub fn payments_ready(&self) -> bool {
        self.payments.enabled
            && self.payments.connected_account_id.is_some()
            && self.payments.onboarding_completed
            && self.payments.charges_enabled
    }

    /// Whether this tenant takes payments at all. The explicit flag wins,
    /// but a connected account that finished onboarding (or has charges
    /// and payouts live) counts even when the flag was never set.
    pub fn payments_functional(&self) -> bool {
        self.payments.enabled
            || (self.payments.connected_account_id.is_some() && self.payments.onboarding_completed)
            || (self.payments.charges_enabled && self.payments.payouts_enabled)
    }

    /// Access rule: unexpired free account, or active/trialing subscription.
    /// past_due gets no grace period.
    pub fn has_subscription_access(&self, now: DateTime<Utc>) -> bool {
        if self.subscription.is_free_account {
            return match self.subscription.free_account_expires {
                Some(expires) => now <= expires,
                None => true,
            };
        }
        matches!(
            self.subscription.status,
            Some(SubscriptionStatus::Active) | Some(SubscriptionStatus::Trialing)
        )
    }
}

// ── Conversations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
    Expired,
    Cancelled,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConversationStatus::Active)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Expired => "expired",
            ConversationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ConversationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "completed" => Ok(ConversationStatus::Completed),
            "expired" => Ok(ConversationStatus::Expired),
            "cancelled" => Ok(ConversationStatus::Cancelled),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One reservable slot, formatted for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotOption {
    /// Fully qualified instant (RFC 3339, tenant-local offset).
    pub datetime: String,
    /// e.g. "9 de junio de 2025"
    pub display_date: String,
    /// e.g. "02:00 PM"
    pub display_time: String,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`
    pub time: String,
}

/// Availability outcome stored on the draft so a later turn can interpret
/// an index reply against the offered alternatives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailabilityBlock {
    pub available: bool,
    pub exact_match: bool,
    /// True when the alternatives are for the requested date.
    #[serde(default)]
    pub slots_for_date: bool,
    #[serde(default)]
    pub alternatives: Vec<SlotOption>,
    pub error: Option<String>,
    pub message: Option<String>,
}

/// The appointment intent draft being assembled across turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentDraft {
    pub name: Option<String>,
    pub reason: Option<String>,
    /// ISO 8601 with tenant-local offset.
    pub datetime: Option<String>,
    pub raw_datetime: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    pub booking_id: Option<String>,
    pub payment_id: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub availability: Option<AvailabilityBlock>,
    /// Set while a reminder-driven reschedule is in flight; on confirm the
    /// pipeline updates this CRM appointment instead of creating one.
    pub rescheduling_appointment_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    pub appointment: Option<AppointmentDraft>,
    pub user_name: Option<String>,
    pub phone_number: Option<String>,
    #[serde(default)]
    pub awaiting_confirmation: bool,
    pub confirmation_sent_at: Option<DateTime<Utc>>,
    /// Free-form metadata; carries the CRM contact id once created.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConversationContext {
    pub fn contact_id(&self) -> Option<&str> {
        self.metadata.get("contact_id").and_then(|v| v.as_str())
    }

    pub fn set_contact_id(&mut self, id: &str) {
        self.metadata
            .insert("contact_id".to_string(), serde_json::Value::from(id));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub account_id: String,
    /// Canonical (digits-only) patient phone.
    pub phone_number: String,
    pub messages: Vec<StoredMessage>,
    pub context: ConversationContext,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(id: String, account_id: String, phone_number: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            account_id,
            phone_number,
            messages: Vec::new(),
            context: ConversationContext::default(),
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn add_message(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        self.messages.push(StoredMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        });
        self.updated_at = Utc::now();
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| now > e)
    }

    /// Messages for the LLM turn: system entries are bookkeeping, not context.
    pub fn messages_for_llm(&self) -> Vec<(MessageRole, &str)> {
        self.messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| (m.role, m.content.as_str()))
            .collect()
    }
}

// ── Bookings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookingStatus {
    Pending,
    PendingPayment,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
    SlotUnavailable,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::PendingPayment => "pending-payment",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no-show",
            BookingStatus::SlotUnavailable => "slot-unavailable",
        };
        f.write_str(s)
    }
}

impl FromStr for BookingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "pending-payment" => Ok(BookingStatus::PendingPayment),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            "no-show" => Ok(BookingStatus::NoShow),
            "slot-unavailable" => Ok(BookingStatus::SlotUnavailable),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingSource {
    Chat,
    Directory,
}

impl fmt::Display for BookingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingSource::Chat => "chat",
            BookingSource::Directory => "directory",
        })
    }
}

impl FromStr for BookingSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(BookingSource::Chat),
            "directory" => Ok(BookingSource::Directory),
            other => Err(format!("unknown booking source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        })
    }
}

impl FromStr for PaymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientInfo {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub reason: Option<String>,
}

/// Unified record spanning both booking channels. Aggregate root: payment
/// and CRM appointment are linked by id, never embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    /// Tenant id for the chat flow, directory-profile id for the public one.
    pub doctor_id: String,
    pub patient: PatientInfo,
    pub appointment_at: DateTime<Utc>,
    /// Display strings, e.g. "lunes, 25 de julio de 2025" / "10:00 a.m."
    pub appointment_date: String,
    pub appointment_time: String,
    pub source: BookingSource,
    pub status: BookingStatus,
    pub payment_required: bool,
    pub payment_id: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    /// CRM appointment id, set only once finalization succeeds.
    pub appointment_id: Option<String>,
    pub calendar_id: Option<String>,
    pub contact_id: Option<String>,
    pub doctor_name: Option<String>,
    pub location: Option<String>,
    pub specialty: Option<String>,
    pub consultation_price: Option<i64>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

// ── Payments ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub account_id: String,
    /// Conversation reference for chat payments, booking id for directory.
    pub conversation_id: Option<String>,
    pub booking_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub checkout_url: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub appointment_id: Option<String>,
    pub source: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRow {
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub scope: Option<String>,
    pub location_id: Option<String>,
    /// Absolute expiry instant (unix seconds).
    pub expires_at: i64,
    pub expires_in: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRow {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at
    }
}

// ── Reminders ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderSent {
    pub appointment_id: String,
    pub contact_id: String,
    pub contact_phone: String,
    pub appointment_time: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub account_id: String,
    pub location_id: Option<String>,
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveReminderContext {
    pub id: String,
    /// Canonical phone the context is keyed by.
    pub phone_number: String,
    pub appointment_id: String,
    pub account_id: String,
    pub location_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderRunStats {
    pub total_accounts: u32,
    pub total_appointments: u32,
    pub reminders_sent: u32,
    pub errors: Vec<String>,
}

// ── Directory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryProfile {
    pub id: String,
    pub account_id: String,
    pub enabled: bool,
    pub full_name: String,
    pub specialty: Option<String>,
    pub photo_url: Option<String>,
    #[serde(default)]
    pub credentials: Vec<String>,
    pub consultation_price: Option<i64>,
    #[serde(default)]
    pub languages: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub office_address: Option<String>,
    pub schedule: Option<serde_json::Value>,
    pub rating: Option<f64>,
    pub rating_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Subscriptions (billing rows) ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub id: String,
    pub account_id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub tier_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTier {
    pub id: String,
    pub name: String,
    /// Minor units.
    pub monthly_price: i64,
    pub annual_price: Option<i64>,
    /// Processor price ids, created lazily.
    pub monthly_price_id: Option<String>,
    pub annual_price_id: Option<String>,
    #[serde(default)]
    pub products: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account() -> Account {
        Account {
            id: "acct-1".into(),
            name: "Consultorio Demo".into(),
            email: None,
            phone_number_id: "pnid-1".into(),
            calendar_id: "cal-1".into(),
            location_id: "loc-1".into(),
            assigned_user_id: "user-1".into(),
            custom_prompt: None,
            status: AccountStatus::Active,
            payments: PaymentsBlock::default(),
            subscription: SubscriptionBlock::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn payments_ready_requires_all_three_flags() {
        let mut a = account();
        a.payments.enabled = true;
        assert!(!a.payments_ready());
        a.payments.connected_account_id = Some("acct_x".into());
        assert!(!a.payments_ready());
        a.payments.onboarding_completed = true;
        assert!(!a.payments_ready());
        a.payments.charges_enabled = true;
        assert!(a.payments_ready());
    }

    #[test]
    fn free_account_access_expires() {
        let now = Utc::now();
        let mut a = account();
        a.subscription.is_free_account = true;
        assert!(a.has_subscription_access(now));

        a.subscription.free_account_expires = Some(now - Duration::hours(1));
        assert!(!a.has_subscription_access(now));

        a.subscription.free_account_expires = Some(now + Duration::hours(1));
        assert!(a.has_subscription_access(now));
    }

    #[test]
    fn past_due_has_no_grace() {
        let now = Utc::now();
        let mut a = account();
        a.subscription.status = Some(SubscriptionStatus::PastDue);
        assert!(!a.has_subscription_access(now));
        a.subscription.status = Some(SubscriptionStatus::Trialing);
        assert!(a.has_subscription_access(now));
        a.subscription.status = Some(SubscriptionStatus::Active);
        assert!(a.has_subscription_access(now));
    }

    #[test]
    fn booking_status_round_trips_kebab_case() {
        for s in [
            BookingStatus::Pending,
            BookingStatus::PendingPayment,
            BookingStatus::NoShow,
            BookingStatus::SlotUnavailable,
        ] {
            let text = s.to_string();
            assert_eq!(text.parse::<BookingStatus>().unwrap(), s);
        }
        assert_eq!(BookingStatus::SlotUnavailable.to_string(), "slot-unavailable");
    }

    #[test]
    fn llm_messages_exclude_system_entries() {
        let mut c = Conversation::new("c1".into(), "a1".into(), "521333".into());
        c.add_message(MessageRole::User, "hola", HashMap::new());
        c.add_message(MessageRole::System, "bookkeeping", HashMap::new());
        c.add_message(MessageRole::Assistant, "¡Hola!", HashMap::new());
        let msgs = c.messages_for_llm();
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|(r, _)| *r != MessageRole::System));
    }

    #[test]
    fn token_expiry_is_absolute() {
        let t = TokenRow {
            account_id: "a".into(),
            access_token: "at".into(),
            refresh_token: "rt".into(),
            token_type: "Bearer".into(),
            scope: None,
            location_id: None,
            expires_at: 1_000,
            expires_in: 3600,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!t.is_expired(999));
        assert!(t.is_expired(1_000));
        assert!(t.is_expired(1_001));
    }
}
