//! Market Watcher
//!
//! Keeps two websocket connections to the exchange, stores new trades and
//! changed order book snapshots, and publishes the id of each stored snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use market_watcher::{
    logging, BitmexConnector, LoopExit, MarketWatcher, Publisher, SqliteStore, WatcherConfig, WatcherMetrics,
    VERSION,
};

/// Pause after teardown so buffered log lines and close frames get out
const EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct HealthState {
    config: Arc<WatcherConfig>,
    metrics: Arc<WatcherMetrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(WatcherConfig::load().context("Failed to load configuration")?);
    logging::init(&config).context("Failed to initialize logging")?;

    info!(version = VERSION, instance = %config.instance_name, "Starting market watcher");

    let metrics = Arc::new(WatcherMetrics::new()?);

    let health_state = HealthState {
        config: config.clone(),
        metrics: metrics.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    let store = Arc::new(SqliteStore::from_config(&config).context("Failed to open the store")?);
    let publisher = Arc::new(Publisher::new(&config.publish_socket_path).await);
    let connector = BitmexConnector::new(&config);

    let watcher = Arc::new(
        MarketWatcher::start(config.clone(), connector, store, publisher, metrics)
            .await
            .context("Failed to start market watcher")?,
    );

    // A signal lets the current iteration finish before the loop returns.
    tokio::spawn({
        let watcher = watcher.clone();
        async move {
            shutdown_signal().await;
            info!("Termination signal received");
            watcher.request_stop();
        }
    });

    let outcome = watcher.run_loop().await;

    watcher.shutdown().await;
    tokio::time::sleep(EXIT_GRACE).await;

    match outcome {
        Ok(LoopExit::Stopped) => Ok(()),
        Ok(exit) => {
            error!(reason = %exit, "Market watcher stopped");
            anyhow::bail!("run loop aborted: {}", exit)
        }
        Err(e) => Err(e).context("run loop failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: HealthState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<HealthState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "market-watcher",
        "instance": state.config.instance_name,
        "symbol": state.config.symbol,
        "version": VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<HealthState>) -> Result<String, (StatusCode, String)> {
    state
        .metrics
        .encode()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
