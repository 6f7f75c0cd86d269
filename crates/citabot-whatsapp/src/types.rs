//! Inbound webhook envelope parsing and outbound message payloads.

use citabot_core::phone::normalize_phone;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Interactive,
    Image,
    Document,
    Audio,
    Video,
    Location,
    Contacts,
    Sticker,
}

/// The interactive button the user tapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonReplyPayload {
    pub id: String,
    pub title: String,
}

/// Flat record parsed out of the nested webhook envelope.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    /// Canonical (digits-only) sender phone.
    pub from_number: String,
    /// WhatsApp business phone id — the tenant key.
    pub phone_number_id: String,
    pub message_type: MessageType,
    pub timestamp: String,
    /// Text body; for button taps the button title is flattened here.
    pub text: Option<String>,
    pub button_reply: Option<ButtonReplyPayload>,
    pub media_id: Option<String>,
    /// Profile name the platform supplied for the sender, if any.
    pub contact_name: Option<String>,
}

impl InboundMessage {
    /// Parse the nested `entry[].changes[].value` envelope. Returns `None`
    /// for empty deliveries (status callbacks) and unsupported types —
    /// those are acknowledged without processing.
    pub fn from_webhook(data: &Value) -> Option<Self> {
        let value = data
            .get("entry")?
            .get(0)?
            .get("changes")?
            .get(0)?
            .get("value")?;

        let message = value.get("messages")?.get(0)?;
        let phone_number_id = value
            .get("metadata")?
            .get("phone_number_id")?
            .as_str()?
            .to_string();

        let contact_name = value
            .get("contacts")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("profile"))
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(String::from);

        let (message_type, text, button_reply, media_id) = if let Some(t) = message.get("text") {
            (
                MessageType::Text,
                t.get("body").and_then(|b| b.as_str()).map(String::from),
                None,
                None,
            )
        } else if let Some(interactive) = message.get("interactive") {
            let reply = interactive
                .get("button_reply")
                .and_then(|r| serde_json::from_value::<ButtonReplyPayload>(r.clone()).ok());
            // Flatten the tapped button's title into the text field.
            let title = reply.as_ref().map(|r| r.title.clone());
            (MessageType::Interactive, title, reply, None)
        } else if let Some(image) = message.get("image") {
            (
                MessageType::Image,
                None,
                None,
                image.get("id").and_then(|i| i.as_str()).map(String::from),
            )
        } else {
            return None;
        };

        let from_number = normalize_phone(message.get("from")?.as_str()?)?;

        Some(Self {
            message_id: message.get("id")?.as_str()?.to_string(),
            from_number,
            phone_number_id,
            message_type,
            timestamp: message
                .get("timestamp")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            text,
            button_reply,
            media_id,
            contact_name,
        })
    }

    pub fn button_id(&self) -> Option<&str> {
        self.button_reply.as_ref().map(|r| r.id.as_str())
    }
}

// ── Outgoing payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ButtonReply {
    pub id: String,
    pub title: String,
}

impl ButtonReply {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "type": "reply",
            "reply": {"id": self.id, "title": self.title}
        })
    }
}

/// Interactive message: body + up to three reply buttons.
#[derive(Debug, Clone)]
pub struct InteractiveMessage {
    pub body_text: String,
    pub buttons: Vec<ButtonReply>,
    pub header_text: Option<String>,
    pub footer_text: Option<String>,
}

impl InteractiveMessage {
    fn to_json(&self) -> Value {
        let mut interactive = json!({
            "type": "button",
            "body": {"text": self.body_text},
            "action": {
                "buttons": self.buttons.iter().take(3).map(|b| b.to_json()).collect::<Vec<_>>()
            }
        });
        if let Some(header) = &self.header_text {
            interactive["header"] = json!({"type": "text", "text": header});
        }
        if let Some(footer) = &self.footer_text {
            interactive["footer"] = json!({"text": footer});
        }
        interactive
    }
}

/// Outgoing message body for the Graph API.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    Text { to: String, body: String },
    Interactive { to: String, interactive: InteractiveMessage },
}

impl OutgoingMessage {
    pub fn to(&self) -> &str {
        match self {
            OutgoingMessage::Text { to, .. } => to,
            OutgoingMessage::Interactive { to, .. } => to,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::Text { .. } => "text",
            OutgoingMessage::Interactive { .. } => "interactive",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OutgoingMessage::Text { to, body } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": {"body": body},
            }),
            OutgoingMessage::Interactive { to, interactive } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "interactive",
                "interactive": interactive.to_json(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(message: Value) -> Value {
        json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": {"phone_number_id": "pnid-1"},
                        "contacts": [{"profile": {"name": "Juan Pérez"}}],
                        "messages": [message],
                    }
                }]
            }]
        })
    }

    #[test]
    fn parses_text_message() {
        let data = envelope(json!({
            "id": "wamid.abc",
            "from": "5213319858734",
            "timestamp": "1720000000",
            "text": {"body": "Hola, quiero una cita"},
        }));
        let m = InboundMessage::from_webhook(&data).unwrap();
        assert_eq!(m.message_id, "wamid.abc");
        assert_eq!(m.message_type, MessageType::Text);
        assert_eq!(m.from_number, "5213319858734");
        assert_eq!(m.phone_number_id, "pnid-1");
        assert_eq!(m.text.as_deref(), Some("Hola, quiero una cita"));
        assert_eq!(m.contact_name.as_deref(), Some("Juan Pérez"));
    }

    #[test]
    fn sender_phone_is_canonicalized() {
        // CRM-style long form without the mobile 1.
        let data = envelope(json!({
            "id": "wamid.abc",
            "from": "523319858734",
            "timestamp": "1720000000",
            "text": {"body": "hola"},
        }));
        let m = InboundMessage::from_webhook(&data).unwrap();
        assert_eq!(m.from_number, "5213319858734");
    }

    #[test]
    fn parses_button_reply_and_flattens_title() {
        let data = envelope(json!({
            "id": "wamid.btn",
            "from": "5213319858734",
            "timestamp": "1720000000",
            "interactive": {
                "type": "button_reply",
                "button_reply": {"id": "confirm_yes", "title": "✅ Sí, confirmar"},
            },
        }));
        let m = InboundMessage::from_webhook(&data).unwrap();
        assert_eq!(m.message_type, MessageType::Interactive);
        assert_eq!(m.button_id(), Some("confirm_yes"));
        assert_eq!(m.text.as_deref(), Some("✅ Sí, confirmar"));
    }

    #[test]
    fn parses_image_message() {
        let data = envelope(json!({
            "id": "wamid.img",
            "from": "5213319858734",
            "timestamp": "1720000000",
            "image": {"id": "media-77"},
        }));
        let m = InboundMessage::from_webhook(&data).unwrap();
        assert_eq!(m.message_type, MessageType::Image);
        assert_eq!(m.media_id.as_deref(), Some("media-77"));
    }

    #[test]
    fn unsupported_types_and_status_callbacks_return_none() {
        let sticker = envelope(json!({
            "id": "wamid.stk",
            "from": "5213319858734",
            "timestamp": "1720000000",
            "sticker": {"id": "stk-1"},
        }));
        assert!(InboundMessage::from_webhook(&sticker).is_none());

        // Delivery-status callbacks have no messages array.
        let status_only = json!({
            "entry": [{"changes": [{"value": {
                "metadata": {"phone_number_id": "pnid-1"},
                "statuses": [{"status": "delivered"}],
            }}]}]
        });
        assert!(InboundMessage::from_webhook(&status_only).is_none());
        assert!(InboundMessage::from_webhook(&json!({})).is_none());
    }

    #[test]
    fn text_payload_shape() {
        let msg = OutgoingMessage::Text {
            to: "5213319858734".into(),
            body: "Hola".into(),
        };
        let v = msg.to_json();
        assert_eq!(v["messaging_product"], "whatsapp");
        assert_eq!(v["recipient_type"], "individual");
        assert_eq!(v["type"], "text");
        assert_eq!(v["text"]["body"], "Hola");
    }

    #[test]
    fn interactive_payload_caps_buttons_at_three() {
        let msg = OutgoingMessage::Interactive {
            to: "5213319858734".into(),
            interactive: InteractiveMessage {
                body_text: "¿Confirmas?".into(),
                buttons: vec![
                    ButtonReply::new("a", "A"),
                    ButtonReply::new("b", "B"),
                    ButtonReply::new("c", "C"),
                    ButtonReply::new("d", "D"),
                ],
                header_text: None,
                footer_text: Some("Por favor confirma tu cita".into()),
            },
        };
        let v = msg.to_json();
        let buttons = v["interactive"]["action"]["buttons"].as_array().unwrap();
        assert_eq!(buttons.len(), 3);
        assert_eq!(buttons[0]["reply"]["id"], "a");
        assert_eq!(v["interactive"]["footer"]["text"], "Por favor confirma tu cita");
        assert!(v["interactive"].get("header").is_none());
    }
}
