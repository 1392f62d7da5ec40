use anyhow::Result;
use axum::{
    routing::{get, post},
    serve, Router,
};
use relay_core::{
    cache::RelayCache,
    config::RelayConfig,
    metrics::MetricsCollector,
    proxy::RelayEngine,
    upstream::{EndpointRegistry, HealthMonitor, HttpClient},
};
use router::AppState;
use rustls::crypto::{ring::default_provider, CryptoProvider};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod router;

/// Cadence of the config reload worker. The registry additionally throttles
/// actual reload attempts to the same interval on wall clock.
const RELOAD_TICK: Duration = Duration::from_secs(30);

/// Maximum accepted request body size.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Initializes the logging system based on the configuration.
fn init_logging(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,relay_core={level},relay_server={level}",
            level = config.logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("failed to install crypto provider: {e:?}"))?;

    let config_path = PathBuf::from(
        std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string()),
    );

    // An invalid initial config is an unrecoverable startup failure.
    let config = RelayConfig::load(&config_path)
        .map_err(|e| anyhow::anyhow!("configuration rejected: {e}"))?;

    init_logging(&config);
    info!(config = %config_path.display(), "starting JSON-RPC relay");

    let metrics = Arc::new(
        MetricsCollector::new().map_err(|e| anyhow::anyhow!("metrics init failed: {e}"))?,
    );
    let http = Arc::new(
        HttpClient::new(config.relay.max_connections)
            .map_err(|e| anyhow::anyhow!("http client init failed: {e}"))?,
    );

    let bind = format!("{}:{}", config.relay.host, config.relay.port);
    let endpoints = config.endpoints().count();

    let registry = Arc::new(EndpointRegistry::new(config_path, config));
    let cache = Arc::new(RelayCache::new());
    let engine = Arc::new(RelayEngine::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        Arc::clone(&http),
        Arc::clone(&metrics),
    ));

    info!(endpoints, "endpoint registry initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&http),
        Arc::clone(&cache),
        Arc::clone(&metrics),
    ));
    let monitor_handle = monitor.start(shutdown_tx.subscribe());
    let reload_handle = spawn_config_reloader(Arc::clone(&registry), shutdown_tx.subscribe());

    let max_concurrent = registry.current().config.relay.max_connections;
    let app = Router::new()
        .route("/", post(router::handle_rpc).get(router::handle_liveness))
        .route("/status", get(router::handle_status))
        .route("/metrics", get(router::handle_metrics))
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(AppState { engine });

    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {bind}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {addr}: {e}"))?;
    info!(address = %addr, "relay listening");

    if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "server error occurred");
    }

    // Stop the workers and wait for them before releasing the listener.
    let _ = shutdown_tx.send(());
    let _ = monitor_handle.await;
    let _ = reload_handle.await;
    info!("relay shutdown complete");

    Ok(())
}

/// Periodically asks the registry to pick up on-disk config changes.
fn spawn_config_reloader(
    registry: Arc<EndpointRegistry>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RELOAD_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate first tick; startup already loaded

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match registry.reload_if_changed() {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!("config unchanged"),
                        Err(e) => error!(error = %e, "config reload rejected, keeping current snapshot"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("config reloader shutting down");
                    break;
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}
