use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use citabot_gateway::app;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "citabot_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path via CITABOT_CONFIG > ~/.citabot/citabot.toml
    let config_path = std::env::var("CITABOT_CONFIG").ok();
    let config = citabot_core::config::CitabotConfig::load(config_path.as_deref())?;

    let stores = citabot_store::Stores::open(&config.database.path)?;

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let state = Arc::new(app::AppState::new(config, stores));

    spawn_cleanup_loop(state.clone());

    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("citabot gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Hourly sweep of TTL'd rows: processed-message claims, expired
/// conversations, expired reminder contexts.
fn spawn_cleanup_loop(state: Arc<app::AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let stores = &state.engine.stores;
            if let Err(e) = stores.dedup.cleanup(state.config.dedup.ttl_hours) {
                warn!(error = %e, "dedup cleanup failed");
            }
            if let Err(e) = stores.conversations.cleanup_expired() {
                warn!(error = %e, "conversation cleanup failed");
            }
            if let Err(e) = stores.reminders.cleanup_expired_contexts() {
                warn!(error = %e, "reminder context cleanup failed");
            }
        }
    });
}
