use std::sync::Arc;

use anyhow::Context;

use farmflow_api::app::{build_app, services::build_services};
use farmflow_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    farmflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let jwt_secret = match &config.jwt_secret {
        Some(secret) => secret.clone(),
        None if config.use_persistent_stores => anyhow::bail!("JWT_SECRET must be set"),
        None => {
            tracing::warn!("JWT_SECRET not set; using insecure dev default");
            "dev-secret".to_string()
        }
    };

    let services = Arc::new(build_services(&config).await?);

    let worker = if config.run_embedded_worker {
        Some(services.spawn_worker())
    } else {
        tracing::info!("embedded worker disabled; run farmflow-worker separately");
        None
    };

    let app = build_app(services, jwt_secret);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
