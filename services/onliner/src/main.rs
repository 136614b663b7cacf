//! Presence Onliner
//!
//! Single-binary service that:
//! 1. Loads the desired credential set from its store
//! 2. Keeps one platform session online per credential
//! 3. Serves an HTTP API to add and remove credentials
//! 4. Releases every session on SIGINT/SIGTERM

mod api;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use session_pool::{CredentialStore, EventBus, PoolManager, spawn_driver, spawn_log_sink};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AppState, build_router};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting presence-onliner");

    // Install before the pool records anything
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    match &config_path {
        Some(path) => info!(path = %path.display(), "loading configuration"),
        None => info!("no config file found, using defaults"),
    }
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    let auth_token = config
        .auth_token
        .clone()
        .context("AUTH_TOKEN resolved to nothing")?;

    info!(
        listen_addr = %config.server.listen_addr,
        store = %config.store.path.display(),
        api_base = %config.platform.api_base,
        full_reload = config.pool.full_reload,
        reconcile_interval_secs = config.pool.reconcile_interval_secs,
        "configuration loaded"
    );

    let store = CredentialStore::open(config.store.path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credential store at {}",
                config.store.path.display()
            )
        })?;

    let connector = platform::RestConnector::new(reqwest::Client::new(), config.rest_config());
    let events = EventBus::new();
    let _log_sink = spawn_log_sink(events.subscribe());

    let pool = Arc::new(PoolManager::new(
        Arc::new(connector),
        Arc::new(store),
        events,
        config.pool_policy(),
    ));
    let (handle, driver) = spawn_driver(pool.clone(), config.reconcile_interval());
    handle.ready();

    let state = AppState {
        pool: pool.clone(),
        handle,
        auth_token: Arc::new(auth_token),
        started_at: Instant::now(),
        prometheus,
    };
    let app = build_router(state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Ok(())) => info!("http server stopped"),
        Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
        Err(e) => error!(error = %e, "server task panicked"),
    }

    driver.abort();
    // The grace delay inside shutdown also lets the log sink drain
    let released = pool.shutdown().await;
    info!(released, "sessions released");

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
