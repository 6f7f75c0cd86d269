use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CRM API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("No tokens stored for account {account_id}")]
    NoTokens { account_id: String },

    /// Refresh failed. Callers must surface a reauthorization message and
    /// stop — the old refresh token is left untouched for investigation.
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Store(#[from] citabot_store::StoreError),
}

impl CrmError {
    /// Auth problems get their own user-visible handling; everything else
    /// is an upstream failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, CrmError::NoTokens { .. } | CrmError::TokenRefresh(_))
    }
}

impl From<CrmError> for citabot_core::AppError {
    fn from(e: CrmError) -> Self {
        match e {
            CrmError::NoTokens { account_id } => citabot_core::AppError::Token(format!(
                "no CRM tokens for account {account_id}; reauthorization required"
            )),
            CrmError::TokenRefresh(reason) => citabot_core::AppError::Token(format!(
                "token refresh failed; reauthorization required: {reason}"
            )),
            other => citabot_core::AppError::external("CRM", other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CrmError>;
