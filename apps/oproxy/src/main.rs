use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Json;
use axum::routing::get;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let mut patch = oproxy_core::bootstrap::patch_from_env();
    patch.overlay(cli.into_patch());
    let config = patch.into_config().context("configuration incomplete")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics recorder install failed")?;

    let boot = oproxy_core::bootstrap::bootstrap(config).await?;
    let request_timeout = Duration::from_secs(boot.config.request_timeout_secs);

    let state = oproxy_router::ProxyState {
        engine: Arc::clone(&boot.engine),
        router: Arc::clone(&boot.router),
        auth: Arc::clone(&boot.auth),
        limiter: Arc::clone(&boot.limiter),
        request_timeout,
    };

    let app = axum::Router::new()
        .merge(oproxy_router::proxy_router(state))
        .route(
            "/healthz",
            get(|| async { Json(serde_json::json!({"status": "ok"})) }),
        )
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        );

    let bind = format!("{}:{}", boot.config.host, boot.config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind failed on {bind}"))?;
    tracing::info!(address = %bind, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
