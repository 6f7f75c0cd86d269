use thiserror::Error;

/// Top-level error for user-facing flows. Every variant maps to a stable
/// error code and an HTTP status at the API boundary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("{resource} not found: {id}")]
    ResourceNotFound { resource: String, id: String },

    #[error("{service} error: {reason}")]
    ExternalService { service: String, reason: String },

    /// Token problems surface as 401 with a reauthorize hint so an
    /// administrator can re-run the OAuth flow for the tenant.
    #[error("Token error: {0}")]
    Token(String),

    #[error("Rate limit exceeded")]
    RateLimit { retry_after_secs: u64 },

    #[error("Conversation error: {0}")]
    Conversation(String),

    #[error("Business logic error: {0}")]
    BusinessLogic(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(resource: &str, id: &str) -> Self {
        AppError::ResourceNotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn external(service: &str, reason: impl Into<String>) -> Self {
        AppError::ExternalService {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable error code string used in API response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Authentication(_) => "AUTHENTICATION_ERROR",
            AppError::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            AppError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            AppError::Token(_) => "TOKEN_ERROR",
            AppError::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            AppError::Conversation(_) => "CONVERSATION_ERROR",
            AppError::BusinessLogic(_) => "BUSINESS_LOGIC_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::Authentication(_) => 401,
            AppError::ResourceNotFound { .. } => 404,
            AppError::ExternalService { .. } => 502,
            AppError::Token(_) => 401,
            AppError::RateLimit { .. } => 429,
            AppError::Conversation(_) => 400,
            AppError::BusinessLogic(_) => 400,
            AppError::Configuration(_) => 500,
            AppError::Serialization(_) => 500,
            AppError::Internal(_) => 500,
        }
    }

    /// Serialize to the `{error:{code,message,details}}` body shape.
    pub fn to_body(&self) -> serde_json::Value {
        let details = match self {
            AppError::ResourceNotFound { resource, id } => {
                serde_json::json!({"resource": resource, "id": id})
            }
            AppError::ExternalService { service, .. } => {
                serde_json::json!({"service": service})
            }
            AppError::RateLimit { retry_after_secs } => {
                serde_json::json!({"retry_after": retry_after_secs})
            }
            _ => serde_json::json!({}),
        };
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": details,
            }
        })
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let e = AppError::Validation("bad phone".into());
        assert_eq!(e.code(), "VALIDATION_ERROR");
        assert_eq!(e.http_status(), 400);

        let e = AppError::Token("refresh failed".into());
        assert_eq!(e.http_status(), 401);

        let e = AppError::external("GoHighLevel", "timeout");
        assert_eq!(e.code(), "EXTERNAL_SERVICE_ERROR");
        assert_eq!(e.http_status(), 502);
    }

    #[test]
    fn body_shape_carries_code_message_details() {
        let e = AppError::not_found("Account", "acct-1");
        let body = e.to_body();
        assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
        assert_eq!(body["error"]["details"]["id"], "acct-1");
        assert!(body["error"]["message"].as_str().unwrap().contains("Account"));
    }
}
