mod bootstrap;
mod commands;
mod gc;
mod health;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use concierge_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use concierge_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.trim().to_ascii_lowercase()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

fn app_router(app: &bootstrap::Application) -> Router {
    commands::router(app.runtime.clone())
        .merge(health::router(app.db_pool.clone()))
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let server = &app.config.server;

    let address = format!("{}:{}", server.bind_address, server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("could not bind {address}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gc_task = gc::spawn(
        app.runtime.clone(),
        Duration::from_secs(server.rate_limit_gc_interval_secs),
        shutdown_rx.clone(),
    );

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "concierge-server listening"
    );

    let mut serve_shutdown = shutdown_rx;
    let serving = axum::serve(listener, app_router(&app)).with_graceful_shutdown(async move {
        while serve_shutdown.changed().await.is_ok() {
            if *serve_shutdown.borrow() {
                break;
            }
        }
    });
    let serving = tokio::spawn(async move { serving.await });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "concierge-server stopping"
    );
    shutdown_tx.send_replace(true);

    let grace = Duration::from_secs(server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, serving).await {
        Ok(joined) => joined.context("server task panicked")??,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "in-flight requests did not drain in time"
        ),
    }
    if gc_task.await.is_err() {
        tracing::warn!(event_name = "system.rate_limit_gc.panicked", "cleanup task panicked");
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
