use anyhow::{Context, Result};
use clap::Parser;
use quota_gate::config::Config;
use quota_gate::server::Server;
use quota_gate::throttler::Throttler;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("quota_gate={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quota gate");
    tracing::info!(
        bind_addr = %config.bind_addr,
        store_backend = ?config.store_backend,
        redis_nodes = ?config.redis_nodes,
        redis_cluster = config.redis_cluster,
        failure_mode = ?config.failure_mode,
        "Configuration loaded"
    );

    let throttler = Throttler::connect(&config)
        .await
        .context("Failed to initialize admission service")?;

    Server::new(Arc::new(throttler), config.bind_addr)
        .run()
        .await
        .context("Server error")?;

    Ok(())
}
