use thiserror::Error;

#[derive(Debug, Error)]
pub enum WhatsAppError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WhatsApp API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<WhatsAppError> for citabot_core::AppError {
    fn from(e: WhatsAppError) -> Self {
        citabot_core::AppError::external("WhatsApp", e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WhatsAppError>;
