//! Typed webhook event envelope.

use serde::Deserialize;
use serde_json::Value;

/// The event kinds the service acts on. Everything else is logged and
/// acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    AccountUpdated,
    CapabilityUpdated,
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Other(String),
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "account.updated" => EventKind::AccountUpdated,
            "capability.updated" => EventKind::CapabilityUpdated,
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            other => EventKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Connected account the event originated from, when applicable.
    #[serde(default)]
    pub account: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl WebhookEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, crate::error::PaymentsError> {
        serde_json::from_slice(payload)
            .map_err(|e| crate::error::PaymentsError::Parse(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// `data.object` field as &str, if present.
    pub fn object_str(&self, field: &str) -> Option<&str> {
        self.data.object.get(field).and_then(|v| v.as_str())
    }

    pub fn object_bool(&self, field: &str) -> bool {
        self.data
            .object
            .get(field)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Session metadata value, e.g. `booking_id` or `source`.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.data
            .object
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_checkout_completed_with_metadata() {
        let payload = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "payment_status": "paid",
                "metadata": {"booking_id": "book-7", "source": "directory"},
            }}
        });
        let event = WebhookEvent::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.kind(), EventKind::CheckoutSessionCompleted);
        assert_eq!(event.metadata("booking_id"), Some("book-7"));
        assert_eq!(event.metadata("source"), Some("directory"));
        assert_eq!(event.object_str("id"), Some("cs_1"));
    }

    #[test]
    fn parses_account_updated_with_connected_account() {
        let payload = json!({
            "id": "evt_2",
            "type": "account.updated",
            "account": "acct_connected_1",
            "data": {"object": {
                "email": "doc@example.com",
                "charges_enabled": true,
                "payouts_enabled": false,
                "details_submitted": true,
            }}
        });
        let event = WebhookEvent::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.kind(), EventKind::AccountUpdated);
        assert_eq!(event.account.as_deref(), Some("acct_connected_1"));
        assert!(event.object_bool("charges_enabled"));
        assert!(!event.object_bool("payouts_enabled"));
    }

    #[test]
    fn unknown_types_fall_through_to_other() {
        assert_eq!(
            EventKind::parse("payment_intent.succeeded"),
            EventKind::Other("payment_intent.succeeded".into())
        );
        assert_eq!(
            EventKind::parse("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
    }
}
