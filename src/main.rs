use std::{net::SocketAddr, path::PathBuf, sync::{Arc, RwLock}, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod background;
mod backends;
mod circuit;
mod config;
mod content_filter;
mod cost;
mod dispatcher;
mod error;
mod model;
mod rate_limit;
mod router;
mod state;
mod streaming;
mod tokenizer;
mod traffic;

pub use config::Config;
pub use error::GatewayError;
pub use traffic::TrafficLog;

use crate::{
    background::{fine_tune_sync_loop, NoopFineTuneRepository, NoopFineTunePort},
    circuit::CircuitRegistry,
    content_filter::PermissiveFilter,
    cost::{CostPipeline, InMemoryBudget, InMemoryUsageRepository, PricingTable},
    dispatcher::Dispatcher,
    rate_limit::RateLimiter,
    router::Router as GatewayRouter,
    state::AppState,
    tokenizer::DefaultTokenizer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("LMG_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/llm-gateway/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.validate().context("config failed validation")?;

    info!(
        client_port = config.gateway.client_port,
        admin_port = config.gateway.admin_port,
        "llm-gateway starting"
    );

    let admin_token = config
        .gateway
        .admin_token_env
        .as_deref()
        .and_then(|v| std::env::var(v).ok());
    let fine_tune_sync_sec = config.gateway.fine_tune_sync_sec;
    let client_port = config.gateway.client_port;
    let admin_port = config.gateway.admin_port;
    let traffic_log_capacity = config.gateway.traffic_log_capacity;

    let circuit_threshold = config.resilience.circuit_threshold;
    let circuit_cooldown = Duration::from_secs(config.resilience.circuit_cooldown_sec);
    let rate_limit = config.rate_limit.clone();

    let config: config::ConfigHandle = Arc::new(RwLock::new(Arc::new(config)));

    let circuits = Arc::new(CircuitRegistry::new(circuit_threshold, circuit_cooldown));
    let router = Arc::new(GatewayRouter::new(Arc::clone(&config), Arc::clone(&circuits)));
    let rate_limiter = Arc::new(RateLimiter::new(
        rate_limit.token_limit,
        rate_limit.tokens_per_period,
        rate_limit.period_sec,
        rate_limit.queue_limit,
    ));

    let pricing = PricingTable::from_config(&config::current(&config));
    let cost = Arc::new(CostPipeline::new(
        pricing,
        Arc::new(InMemoryUsageRepository::new()),
        Arc::new(InMemoryBudget::from_config(&config::current(&config).budget)),
    ));

    let tokenizer: Arc<dyn tokenizer::TokenizerPort> = Arc::new(DefaultTokenizer);
    let content_filter: Arc<dyn content_filter::ContentFilter> = Arc::new(PermissiveFilter);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&circuits),
        Arc::clone(&rate_limiter),
        Arc::clone(&router),
        Arc::clone(&cost),
        Arc::clone(&tokenizer),
        Arc::clone(&content_filter),
    ));

    let traffic_log = Arc::new(TrafficLog::new(traffic_log_capacity));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        router: Arc::clone(&router),
        dispatcher,
        circuits,
        cost,
        content_filter,
        tokenizer,
        traffic: traffic_log,
        admin_token,
        started_at: tokio::time::Instant::now(),
    });

    // Config hot-reload watcher — polls the config file every 5 seconds.
    tokio::spawn(config_watcher(Arc::clone(&config), config_path.clone()));

    // Fine-tune job status sync (spec §4.7). No repository is wired by default; supplying
    // one is a deployment-time concern external to this crate.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(fine_tune_sync_loop(
        Arc::new(NoopFineTuneRepository),
        Arc::new(NoopFineTunePort),
        Duration::from_secs(fine_tune_sync_sec),
        shutdown_rx,
    ));

    let client_addr: SocketAddr = format!("0.0.0.0:{client_port}").parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{admin_port}").parse()?;

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let health_route = axum::Router::new()
        .route("/health", axum::routing::get(api::health::healthz))
        .with_state(Arc::clone(&state));
    let metrics_route = axum::Router::new()
        .route("/metrics", axum::routing::get(api::metrics::metrics))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::admin::admin_auth_middleware,
        ))
        .with_state(Arc::clone(&state));

    // `/health` must stay unauthenticated (Docker HEALTHCHECK, k8s probes carry no API
    // key), so it's merged in after the auth layer rather than before.
    let client_app = api::http::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::auth::client_auth_middleware,
        ))
        .merge(health_route.clone())
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    let admin_app = api::admin::router(Arc::clone(&state))
        .merge(metrics_route)
        .merge(health_route)
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `llm-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("LMG_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Polls the config file every 5 seconds and hot-reloads on mtime change.
/// Parse/validation failures are logged and ignored; the running config is unchanged.
async fn config_watcher(config: config::ConfigHandle, path: PathBuf) {
    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await; // first tick fires immediately; skip it

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path).and_then(|c| c.validate().map(|_| c)) {
            Ok(new_cfg) => {
                config::replace(&config, new_cfg);
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed, keeping previous config");
            }
        }
    }
}
