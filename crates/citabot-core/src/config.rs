use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Fixed appointment length. Policy, not CRM-derived.
pub const APPOINTMENT_MINUTES: i64 = 50;
/// Window used when re-checking a slot against blocked events.
pub const RACE_CHECK_MINUTES: i64 = 60;

/// Top-level config (citabot.toml + CITABOT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitabotConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub whatsapp: WhatsAppConfig,
    pub llm: LlmConfig,
    pub crm: CrmConfig,
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Verify token echoed back on the GET webhook handshake.
    pub verify_token: String,
    /// Bearer token for the Graph API.
    pub bearer_token: String,
    /// Public base URI of this deployment, used to build callback URLs.
    pub callback_uri: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    /// OpenAI-compatible chat completions endpoint base.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_crm_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    pub secret_key: String,
    /// Webhook secret for platform (patient payment) events.
    pub webhook_secret: String,
    /// Separate webhook secret for subscription billing events.
    pub subscription_webhook_secret: String,
    #[serde(default = "default_success_url")]
    pub success_url: String,
    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,
    #[serde(default = "default_payments_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "bool_true")]
    pub enable_rate_limiting: bool,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key_header: default_api_key_header(),
            api_keys: Vec::new(),
            enable_rate_limiting: true,
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_messages: default_max_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// When false the access gate is bypassed entirely. Off by default
    /// for pre-launch tenants.
    #[serde(default)]
    pub enforcement_enabled: bool,
    /// Recorded but unused: the access check denies past_due immediately.
    #[serde(default = "default_grace_days")]
    pub grace_period_days: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            enforcement_enabled: false,
            grace_period_days: default_grace_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_dedup_ttl_hours")]
    pub ttl_hours: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: default_dedup_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// IANA timezone all tenant-local date math happens in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            default_country_code: default_country_code(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_graph_base_url() -> String {
    "https://graph.facebook.com/v18.0".to_string()
}
fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}
fn default_llm_temperature() -> f32 {
    0.7
}
fn default_llm_base_url() -> String {
    "https://api.deepseek.com".to_string()
}
fn default_crm_base_url() -> String {
    "https://services.leadconnectorhq.com".to_string()
}
fn default_payments_base_url() -> String {
    "https://api.stripe.com".to_string()
}
fn default_success_url() -> String {
    "https://citabot.example.com/payment/success".to_string()
}
fn default_cancel_url() -> String {
    "https://citabot.example.com/payment/cancel".to_string()
}
fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}
fn default_rate_limit() -> u32 {
    60
}
fn default_ttl_hours() -> i64 {
    24
}
fn default_max_messages() -> usize {
    100
}
fn default_grace_days() -> u32 {
    3
}
fn default_dedup_ttl_hours() -> i64 {
    2
}
fn default_timezone() -> String {
    "America/Mexico_City".to_string()
}
fn default_country_code() -> String {
    "52".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.citabot/citabot.db", home)
}

impl CitabotConfig {
    /// Load config from a TOML file with CITABOT_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CitabotConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CITABOT_").split("_"))
            .extract()
            .map_err(|e| crate::error::AppError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Secrets have no defaults — their absence is a startup error.
    pub fn validate(&self) -> crate::error::Result<()> {
        let required = [
            ("whatsapp.verify_token", &self.whatsapp.verify_token),
            ("whatsapp.bearer_token", &self.whatsapp.bearer_token),
            ("llm.api_key", &self.llm.api_key),
            ("crm.client_id", &self.crm.client_id),
            ("crm.client_secret", &self.crm.client_secret),
            ("payments.secret_key", &self.payments.secret_key),
            ("payments.webhook_secret", &self.payments.webhook_secret),
            (
                "payments.subscription_webhook_secret",
                &self.payments.subscription_webhook_secret,
            ),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(crate::error::AppError::Configuration(format!(
                    "missing required secret: {name}"
                )));
            }
        }
        Ok(())
    }

    /// Tenant timezone, falling back to Mexico City on a bad config value.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.app
            .timezone
            .parse()
            .unwrap_or(chrono_tz::America::Mexico_City)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.citabot/citabot.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> CitabotConfig {
        CitabotConfig {
            server: ServerConfig::default(),
            whatsapp: WhatsAppConfig {
                verify_token: "verify-token-123".into(),
                bearer_token: "graph-bearer-456".into(),
                callback_uri: "https://api.example.com".into(),
                graph_base_url: default_graph_base_url(),
            },
            llm: LlmConfig {
                api_key: "sk-test".into(),
                model: default_llm_model(),
                temperature: default_llm_temperature(),
                base_url: default_llm_base_url(),
            },
            crm: CrmConfig {
                client_id: "client-id-0123".into(),
                client_secret: "client-secret-0123".into(),
                base_url: default_crm_base_url(),
            },
            payments: PaymentsConfig {
                secret_key: "sk_test_123".into(),
                webhook_secret: "whsec_platform".into(),
                subscription_webhook_secret: "whsec_billing".into(),
                success_url: default_success_url(),
                cancel_url: default_cancel_url(),
                base_url: default_payments_base_url(),
            },
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
            conversation: ConversationConfig::default(),
            subscription: SubscriptionConfig::default(),
            dedup: DedupConfig::default(),
            app: AppConfig::default(),
        }
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = minimal();
        assert_eq!(cfg.conversation.ttl_hours, 24);
        assert_eq!(cfg.conversation.max_messages, 100);
        assert_eq!(cfg.dedup.ttl_hours, 2);
        assert!(cfg.dedup.enabled);
        assert!(!cfg.subscription.enforcement_enabled);
        assert_eq!(cfg.app.default_country_code, "52");
        assert_eq!(cfg.crm.base_url, "https://services.leadconnectorhq.com");
    }

    #[test]
    fn missing_secret_is_a_configuration_error() {
        let mut cfg = minimal();
        cfg.payments.webhook_secret = "".into();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn timezone_parses() {
        let cfg = minimal();
        assert_eq!(cfg.tz(), chrono_tz::America::Mexico_City);
    }
}
