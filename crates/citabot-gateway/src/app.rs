use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use citabot_core::config::CitabotConfig;
use citabot_crm::auth::CrmAuth;
use citabot_crm::CrmClient;
use citabot_engine::Engine;
use citabot_payments::PaymentsClient;
use citabot_store::Stores;
use citabot_whatsapp::WhatsAppClient;

use crate::auth::RateLimiter;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: Arc<CitabotConfig>,
    pub engine: Arc<Engine>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: CitabotConfig, stores: Stores) -> Self {
        let config = Arc::new(config);
        let engine = Arc::new(build_engine(config.clone(), stores));
        let rate_limiter = RateLimiter::new(
            config.security.enable_rate_limiting,
            config.security.rate_limit_per_minute,
        );
        Self {
            config,
            engine,
            rate_limiter,
        }
    }
}

/// Wire the adapters and the engine from config + stores.
pub fn build_engine(config: Arc<CitabotConfig>, stores: Stores) -> Engine {
    let mut stores = stores;
    stores.conversations = stores
        .conversations
        .with_limits(config.conversation.ttl_hours, config.conversation.max_messages);

    let crm_auth = Arc::new(CrmAuth::new(
        reqwest::Client::new(),
        stores.tokens.clone(),
        config.crm.client_id.clone(),
        config.crm.client_secret.clone(),
        config.crm.base_url.clone(),
    ));
    let crm = CrmClient::new(crm_auth, config.crm.base_url.clone());
    let whatsapp = WhatsAppClient::new(
        config.whatsapp.graph_base_url.clone(),
        config.whatsapp.bearer_token.clone(),
    );
    let payments = PaymentsClient::new(
        config.payments.base_url.clone(),
        config.payments.secret_key.clone(),
    );
    let llm: Arc<dyn citabot_agent::LlmProvider> =
        Arc::new(citabot_agent::openai::OpenAiCompatProvider::new(
            config.llm.api_key.clone(),
            config.llm.base_url.clone(),
            config.llm.model.clone(),
            config.llm.temperature,
        ));

    Engine {
        config,
        stores,
        crm,
        whatsapp,
        payments,
        llm,
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/webhook", get(crate::http::webhook::verify_handler))
        .route("/webhook", post(crate::http::webhook::inbound_handler))
        .route(
            "/webhooks/payments",
            post(crate::http::payments::payments_webhook_handler),
        )
        .route(
            "/webhooks/subscriptions",
            post(crate::http::payments::subscriptions_webhook_handler),
        )
        .route(
            "/payment/success",
            get(crate::http::payments::payment_success_page),
        )
        .route(
            "/payment/cancel",
            get(crate::http::payments::payment_cancel_page),
        )
        .route(
            "/directory/doctors",
            get(crate::http::directory::list_doctors),
        )
        .route(
            "/directory/doctors/{doctor_id}/availability",
            get(crate::http::directory::doctor_availability),
        )
        .route(
            "/directory/bookings",
            post(crate::http::directory::create_booking),
        )
        .route(
            "/directory/bookings/{booking_id}/payment-success",
            post(crate::http::directory::booking_payment_success),
        )
        .route("/oauth/authorize", get(crate::http::oauth::start_authorize))
        .route("/oauth/callback", get(crate::http::oauth::callback))
        .route(
            "/accounts/{account_id}/payments/onboard",
            post(crate::http::accounts::start_payments_onboarding),
        )
        .route(
            "/accounts/{account_id}/payments/status",
            get(crate::http::accounts::payments_status),
        )
        .route(
            "/accounts/{account_id}/phone/register",
            post(crate::http::accounts::register_phone),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
