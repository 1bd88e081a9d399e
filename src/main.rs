//! BountyView API Server
//!
//! Serves the funding, claim, cancel, withdrawal, and webhook endpoints.

use std::sync::Arc;

use bountyview::server::AppState;
use bountyview::{CircleClient, Config, EscrowChainClient, JobQueue, PgStore, RetryPolicy};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting BountyView API server");

    let config = Config::load()?;

    // Initialize PostgreSQL storage (required)
    let store = PgStore::from_env().await?;
    info!("PostgreSQL storage initialized");

    // Clients are constructed once here and shared by reference; no global
    // singletons.
    let chain = EscrowChainClient::new(&config.chain);
    let circle = CircleClient::new(&config.circle, config.circle_api_key());
    let queue = JobQueue::new(store.pool(), RetryPolicy::default());

    let circle_webhook_secret = config.circle_webhook_secret();
    let github_webhook_secret = config.github_webhook_secret();

    let host = std::env::var("API_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port: u16 = std::env::var("API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.server.port);

    let state = Arc::new(AppState {
        store,
        chain,
        circle,
        queue,
        config,
        circle_webhook_secret,
        github_webhook_secret,
        started_at: std::time::Instant::now(),
    });

    bountyview::server::run_server(&host, port, state).await?;

    Ok(())
}
