//! Standalone forecast worker.
//!
//! Shares configuration with the API server; point both at the same
//! `DATABASE_URL` and Redis to split request handling from prediction.

use anyhow::Context;

use farmflow_api::app::services::build_services;
use farmflow_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    farmflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    if !config.use_persistent_stores {
        tracing::warn!("standalone worker with in-memory stores will never see API requests");
    }

    let services = build_services(&config).await?;
    let worker = services.spawn_worker();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!(stats = ?worker.stats(), "shutting down worker");
    worker.shutdown().await;
    Ok(())
}
