use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{PaymentsError, Result};

const CALL_TIMEOUT_SECS: u64 = 30;
/// Hosted checkout links expire after this window.
pub const CHECKOUT_EXPIRY_MINUTES: i64 = 30;

/// Client for the payment processor's REST API (form-encoded bodies,
/// secret-key bearer auth, connected accounts via the Stripe-Account
/// header).
#[derive(Clone)]
pub struct PaymentsClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CheckoutParams<'a> {
    pub connected_account_id: &'a str,
    pub amount: i64,
    pub currency: &'a str,
    pub description: &'a str,
    pub customer_name: &'a str,
    pub customer_phone: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
    /// Carried to the webhook: must include `source` and, for bookings,
    /// `booking_id`.
    pub metadata: Vec<(&'a str, String)>,
}

impl PaymentsClient {
    pub fn new(base_url: String, secret_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALL_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            secret_key,
        }
    }

    // ── Connected accounts ────────────────────────────────────────────────

    /// Create an Express connected account for a tenant. The caller must
    /// persist the returned id on the tenant immediately, before the
    /// hosted onboarding flow runs, so webhooks arriving mid-onboarding
    /// can be matched.
    #[instrument(skip(self))]
    pub async fn create_connected_account(&self, email: &str) -> Result<ConnectedAccount> {
        let form = vec![
            ("type".to_string(), "express".to_string()),
            ("email".to_string(), email.to_string()),
            ("capabilities[card_payments][requested]".to_string(), "true".to_string()),
            ("capabilities[transfers][requested]".to_string(), "true".to_string()),
        ];
        let account: ConnectedAccount = self.post("/v1/accounts", &form, None).await?;
        info!(connected_account_id = %account.id, "created connected account");
        Ok(account)
    }

    /// Hosted onboarding link for a connected account.
    pub async fn create_account_link(
        &self,
        connected_account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<String> {
        let form = vec![
            ("account".to_string(), connected_account_id.to_string()),
            ("refresh_url".to_string(), refresh_url.to_string()),
            ("return_url".to_string(), return_url.to_string()),
            ("type".to_string(), "account_onboarding".to_string()),
        ];
        let link: Value = self.post("/v1/account_links", &form, None).await?;
        link.get("url")
            .and_then(|u| u.as_str())
            .map(String::from)
            .ok_or_else(|| PaymentsError::Parse("account link without url".into()))
    }

    /// Idempotent status probe. Onboarding is complete iff
    /// `charges_enabled && details_submitted`.
    pub async fn get_account_status(&self, connected_account_id: &str) -> Result<ConnectedAccount> {
        self.get(&format!("/v1/accounts/{connected_account_id}"), None)
            .await
    }

    // ── Patient checkout ──────────────────────────────────────────────────

    /// Checkout session on the connected account for one consultation.
    /// Links expire after [`CHECKOUT_EXPIRY_MINUTES`].
    #[instrument(skip(self, params), fields(connected_account = %params.connected_account_id, amount = params.amount))]
    pub async fn create_checkout_session(
        &self,
        params: CheckoutParams<'_>,
    ) -> Result<CheckoutSession> {
        let expires_at = (Utc::now() + chrono::Duration::minutes(CHECKOUT_EXPIRY_MINUTES))
            .timestamp()
            .to_string();

        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), params.success_url.to_string()),
            ("cancel_url".to_string(), params.cancel_url.to_string()),
            ("expires_at".to_string(), expires_at),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            (
                "line_items[0][price_data][currency]".to_string(),
                params.currency.to_string(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                params.amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                params.description.to_string(),
            ),
            (
                "metadata[customer_name]".to_string(),
                params.customer_name.to_string(),
            ),
            (
                "metadata[customer_phone]".to_string(),
                params.customer_phone.to_string(),
            ),
        ];
        for (key, value) in &params.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        let session: CheckoutSession = self
            .post(
                "/v1/checkout/sessions",
                &form,
                Some(params.connected_account_id),
            )
            .await?;
        info!(session_id = %session.id, "created checkout session");
        Ok(session)
    }

    pub async fn get_checkout_session(
        &self,
        session_id: &str,
        connected_account_id: Option<&str>,
    ) -> Result<Value> {
        self.get(&format!("/v1/checkout/sessions/{session_id}"), connected_account_id)
            .await
    }

    // ── Subscription billing ──────────────────────────────────────────────

    /// Create a billing customer for a tenant (platform account, not the
    /// connected one).
    pub async fn create_customer(&self, email: &str, account_id: &str) -> Result<String> {
        let form = vec![
            ("email".to_string(), email.to_string()),
            ("metadata[account_id]".to_string(), account_id.to_string()),
        ];
        let customer: Value = self.post("/v1/customers", &form, None).await?;
        customer
            .get("id")
            .and_then(|i| i.as_str())
            .map(String::from)
            .ok_or_else(|| PaymentsError::Parse("customer without id".into()))
    }

    /// Lazily create a recurring price for a tier.
    pub async fn create_price(
        &self,
        tier_name: &str,
        amount: i64,
        currency: &str,
        annual: bool,
    ) -> Result<String> {
        let form = vec![
            ("unit_amount".to_string(), amount.to_string()),
            ("currency".to_string(), currency.to_string()),
            (
                "recurring[interval]".to_string(),
                if annual { "year" } else { "month" }.to_string(),
            ),
            ("product_data[name]".to_string(), tier_name.to_string()),
        ];
        let price: Value = self.post("/v1/prices", &form, None).await?;
        price
            .get("id")
            .and_then(|i| i.as_str())
            .map(String::from)
            .ok_or_else(|| PaymentsError::Parse("price without id".into()))
    }

    /// Hosted checkout for a subscription.
    pub async fn create_subscription_checkout(
        &self,
        customer_id: &str,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession> {
        let form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("customer".to_string(), customer_id.to_string()),
            ("line_items[0][price]".to_string(), price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), success_url.to_string()),
            ("cancel_url".to_string(), cancel_url.to_string()),
        ];
        self.post("/v1/checkout/sessions", &form, None).await
    }

    /// Self-service customer portal session.
    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        let session: Value = self.post("/v1/billing_portal/sessions", &form, None).await?;
        session
            .get("url")
            .and_then(|u| u.as_str())
            .map(String::from)
            .ok_or_else(|| PaymentsError::Parse("portal session without url".into()))
    }

    /// Admin-assigned subscription: invoice collection with one day to
    /// pay. Returns (subscription_id, latest_invoice_id).
    #[instrument(skip(self))]
    pub async fn create_invoice_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> Result<(String, Option<String>)> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("collection_method".to_string(), "send_invoice".to_string()),
            ("days_until_due".to_string(), "1".to_string()),
        ];
        let sub: Value = self.post("/v1/subscriptions", &form, None).await?;
        let id = sub
            .get("id")
            .and_then(|i| i.as_str())
            .map(String::from)
            .ok_or_else(|| PaymentsError::Parse("subscription without id".into()))?;
        let invoice = sub
            .get("latest_invoice")
            .and_then(|i| i.as_str())
            .map(String::from);
        Ok((id, invoice))
    }

    /// Finalize a draft invoice and return its hosted payment URL.
    pub async fn finalize_invoice(&self, invoice_id: &str) -> Result<String> {
        let invoice: Value = self
            .post(&format!("/v1/invoices/{invoice_id}/finalize"), &[], None)
            .await?;
        invoice
            .get("hosted_invoice_url")
            .and_then(|u| u.as_str())
            .map(String::from)
            .ok_or_else(|| PaymentsError::Parse("finalized invoice without hosted url".into()))
    }

    // ── Transport ─────────────────────────────────────────────────────────

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        connected_account: Option<&str>,
    ) -> Result<T> {
        let mut req = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(form);
        if let Some(acct) = connected_account {
            req = req.header("Stripe-Account", acct);
        }
        let resp = req.send().await?;
        self.decode(resp).await
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        connected_account: Option<&str>,
    ) -> Result<T> {
        let mut req = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret_key);
        if let Some(acct) = connected_account {
            req = req.header("Stripe-Account", acct);
        }
        let resp = req.send().await?;
        self.decode(resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T> {
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "payments API error");
            return Err(PaymentsError::Api {
                status,
                message: text,
            });
        }
        resp.json()
            .await
            .map_err(|e| PaymentsError::Parse(e.to_string()))
    }
}
