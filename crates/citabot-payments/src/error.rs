use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentsError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Payments API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Webhook signature invalid: {0}")]
    Signature(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<PaymentsError> for citabot_core::AppError {
    fn from(e: PaymentsError) -> Self {
        match e {
            PaymentsError::Signature(reason) => citabot_core::AppError::Authentication(reason),
            other => citabot_core::AppError::external("Payments", other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentsError>;
