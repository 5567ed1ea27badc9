//! Codex gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of OAuth-authenticated accounts from the account store
//! 2. Listens for inbound requests from a local developer-tool client
//! 3. Selects an eligible account, refreshes its token if stale, builds
//!    the forwarded headers, and proxies to the configured upstream
//! 4. On quota rejection, rotates to another account transparently

mod config;
mod error;
mod metrics;
mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::router::{RouterState, route};

#[derive(Clone)]
struct HealthState {
    pool: Arc<gateway_pool::Pool>,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting codex-gateway");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1)).map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        bind_address = %config.bind_address,
        port = config.port,
        base_url = %config.base_url,
        override_auth = config.override_auth,
        account_store_path = %config.account_store_path.display(),
        "configuration loaded"
    );

    let metrics_handle = metrics::install_recorder();

    let store = Arc::new(gateway_store::FileAccountStore::new(config.account_store_path.clone()));
    let http_client = reqwest::Client::new();

    let pool = Arc::new(
        gateway_pool::Pool::load(store, http_client.clone(), config.oauth_client_id.clone(), config.auth_failure_cooldown_ms)
            .await
            .context("failed to load account pool")?,
    );

    if pool.size() == 0 {
        tracing::warn!("account pool is empty; every request will see all_accounts_exhausted until accounts are registered");
    }

    let _refresh_task = gateway_pool::spawn_refresh_task(
        pool.clone(),
        Duration::from_secs(config.refresh_interval_secs),
        config.refresh_threshold_secs,
    );

    let provider: Arc<dyn gateway_provider::Provider> = if config.override_auth {
        Arc::new(gateway_provider::OverrideAuthProvider::new(pool.clone()))
    } else {
        Arc::new(gateway_provider::PassthroughProvider::new())
    };

    let shutdown = CancellationToken::new();

    let router_state = RouterState {
        pool: pool.clone(),
        provider,
        http_client,
        base_url: Arc::new(config.base_url.clone()),
        cooldown_seconds: config.cooldown_seconds,
        max_retry_passes: config.max_retry_passes,
        request_timeout: Duration::from_millis(config.request_timeout_ms),
        retry: config.retry_config(),
        shutdown: shutdown.clone(),
    };

    let health_state = HealthState { pool: pool.clone(), started_at: Instant::now() };

    // `/health` and `/metrics` carry their own state; built and resolved to
    // `Router<()>` separately, then merged into the proxying router, which
    // mirrors axum's documented pattern for routers with different state.
    let health_router = Router::new().route("/health", get(health_handler)).with_state(health_state);
    let metrics_router = Router::new().route("/metrics", get(metrics_handler)).with_state(metrics_handle);

    let app = Router::new()
        .fallback(route)
        .with_state(router_state)
        .merge(health_router)
        .merge(metrics_router);

    let addr = SocketAddr::new(config.bind_address, config.port);
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind to {addr}"))?;

    info!(%addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let pool_health = state.pool.health().await;
    let body = serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pool": pool_health,
    });
    (axum::http::StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string())
}

async fn metrics_handler(State(handle): State<metrics_exporter_prometheus::PrometheusHandle>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, handle.render())
}

/// Wait for SIGTERM or SIGINT, then cancel `shutdown` so in-flight attempts
/// abort at their next suspension point instead of outliving the process.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
    shutdown.cancel();
}
