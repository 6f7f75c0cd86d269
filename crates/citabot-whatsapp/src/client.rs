use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use crate::error::{Result, WhatsAppError};
use crate::types::{ButtonReply, InteractiveMessage, OutgoingMessage};

const CALL_TIMEOUT_SECS: u64 = 30;
/// Registration uses v20.0 — newer versions have known issues with the
/// register endpoint.
const REGISTER_BASE_URL: &str = "https://graph.facebook.com/v20.0";

/// Client for the WhatsApp Business (Graph) API.
#[derive(Clone)]
pub struct WhatsAppClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl WhatsAppClient {
    pub fn new(base_url: String, bearer_token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALL_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            bearer_token,
        }
    }

    /// Send any outgoing message to a tenant's business number.
    #[instrument(skip(self, message), fields(%phone_number_id, to = %message.to(), kind = message.kind()))]
    pub async fn send_message(
        &self,
        phone_number_id: &str,
        message: &OutgoingMessage,
    ) -> Result<Value> {
        self.post_messages(phone_number_id, message.to_json()).await
    }

    pub async fn send_text(&self, phone_number_id: &str, to: &str, body: &str) -> Result<Value> {
        self.send_message(
            phone_number_id,
            &OutgoingMessage::Text {
                to: to.to_string(),
                body: body.to_string(),
            },
        )
        .await
    }

    pub async fn send_interactive(
        &self,
        phone_number_id: &str,
        to: &str,
        body_text: &str,
        buttons: Vec<ButtonReply>,
        footer_text: Option<&str>,
    ) -> Result<Value> {
        self.send_message(
            phone_number_id,
            &OutgoingMessage::Interactive {
                to: to.to_string(),
                interactive: InteractiveMessage {
                    body_text: body_text.to_string(),
                    buttons,
                    header_text: None,
                    footer_text: footer_text.map(String::from),
                },
            },
        )
        .await
    }

    /// Send a pre-approved template message. Returns `None` on failure so
    /// callers can fall back to plain text without plumbing errors.
    #[instrument(skip(self, template_data), fields(%phone_number_id))]
    pub async fn send_template(
        &self,
        phone_number_id: &str,
        template_data: Value,
    ) -> Option<Value> {
        let template_name = template_data
            .pointer("/template/name")
            .and_then(|n| n.as_str())
            .unwrap_or("?")
            .to_string();

        match self.post_messages(phone_number_id, template_data).await {
            Ok(result) => {
                info!(template = %template_name, "template message sent");
                Some(result)
            }
            Err(e) => {
                error!(template = %template_name, error = %e, "template send failed");
                None
            }
        }
    }

    /// Mark an inbound message as read. Failures are logged, not raised.
    pub async fn mark_as_read(&self, phone_number_id: &str, message_id: &str) -> bool {
        let payload = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
        });
        match self.post_messages(phone_number_id, payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%message_id, error = %e, "mark-as-read failed");
                false
            }
        }
    }

    /// Resolve a media id to its download URL.
    pub async fn get_media_url(&self, media_id: &str) -> Option<String> {
        let resp = self
            .http
            .get(format!("{}/{media_id}", self.base_url))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let value: Value = resp.json().await.ok()?;
        value.get("url").and_then(|u| u.as_str()).map(String::from)
    }

    /// One-shot phone registration with the Cloud API.
    #[instrument(skip(self, pin))]
    pub async fn register_phone(
        &self,
        phone_number_id: &str,
        pin: &str,
        data_localization_region: Option<&str>,
    ) -> Result<Value> {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "pin": pin,
        });
        if let Some(region) = data_localization_region {
            payload["data_localization_region"] = json!(region);
        }

        let resp = self
            .http
            .post(format!("{REGISTER_BASE_URL}/{phone_number_id}/register"))
            .bearer_auth(&self.bearer_token)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(%phone_number_id, status, body = %text, "phone registration failed");
            return Err(WhatsAppError::Api {
                status,
                message: text,
            });
        }

        let result: Value = resp
            .json()
            .await
            .map_err(|e| WhatsAppError::Parse(e.to_string()))?;
        info!(%phone_number_id, "phone registered");
        Ok(result)
    }

    async fn post_messages(&self, phone_number_id: &str, payload: Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/{phone_number_id}/messages", self.base_url))
            .bearer_auth(&self.bearer_token)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(status, body = %text, "WhatsApp API error");
            return Err(WhatsAppError::Api {
                status,
                message: text,
            });
        }

        resp.json()
            .await
            .map_err(|e| WhatsAppError::Parse(e.to_string()))
    }
}
