//! Market Gateway Binary
//!
//! Bootstraps the upstream connection pool and serves health and metrics.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `GATEWAY_UPSTREAM_URL`: Upstream WebSocket URL (`ws://` or `wss://`)
//! - `GATEWAY_UPSTREAM_TOKEN`: Upstream access token
//!
//! ## Optional
//! - `GATEWAY_POOL_SIZE`: Connections to bootstrap (default: 4)
//! - `GATEWAY_BOOTSTRAP_TIMEOUT_SECS`: Per-connection bootstrap timeout (default: 30)
//! - `GATEWAY_REQUEST_TIMEOUT_SECS`: Fetch/subscribe timeout (default: 30)
//! - `GATEWAY_KEEPALIVE_INTERVAL_SECS`: Keepalive period (default: 20)
//! - `GATEWAY_KEEPALIVE_TIMEOUT_SECS`: Inbound silence limit (default: 60)
//! - `GATEWAY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `LOG_FORMAT`: `json` or pretty (default: pretty)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log filter (default: info,market_gateway=debug)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use market_gateway::infrastructure::broadcast::{EventHub, EventHubConfig, LifecycleEvent};
use market_gateway::infrastructure::health::{HealthServer, HealthServerState};
use market_gateway::infrastructure::telemetry;
use market_gateway::{
    ConnectionPool, GatewayConfig, MsgPackCodec, SubscriptionHub, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting market gateway");

    let _metrics_handle = init_metrics().context("failed to install Prometheus recorder")?;

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let events = Arc::new(EventHub::new(EventHubConfig::from(config.events)));
    spawn_lifecycle_logger(&events, shutdown_token.clone());

    let pool = Arc::new(ConnectionPool::new(
        Arc::new(MsgPackCodec::new()),
        config.connection,
        config.pool,
        Arc::clone(&events),
    ));

    let connected = pool
        .initialize(
            &config.upstream.url,
            &config.upstream.token,
            config.pool.size,
        )
        .await
        .context("connection pool bootstrap failed")?;
    tracing::info!(connected, "Connection pool bootstrapped");

    let primary = pool
        .primary()
        .context("no ready connection after pool bootstrap")?;
    let hub = Arc::new(SubscriptionHub::new(primary));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&pool),
        Arc::clone(&hub),
        Arc::clone(&events),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let ready_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        ready_pool.wait_ready().await;
        tracing::info!("Security index loaded, gateway ready");
    });

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        hub.shutdown().await;
        pool.shutdown().await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, exiting anyway"
        );
    }

    tracing::info!("Market gateway stopped");
    Ok(())
}

/// Log lifecycle events until shutdown.
fn spawn_lifecycle_logger(events: &EventHub, shutdown: CancellationToken) {
    let mut rx = events.lifecycle_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(LifecycleEvent::Error { connection, error }) => {
                        tracing::warn!(connection_id = connection, error = %error, "Connection error");
                    }
                    Ok(LifecycleEvent::Disconnected { connection }) => {
                        tracing::warn!(connection_id = connection, "Connection closed");
                    }
                    Ok(LifecycleEvent::MarketStatus { connection, status }) => {
                        tracing::info!(
                            connection_id = connection,
                            market = %status.market,
                            state = ?status.state,
                            "Market status"
                        );
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Lifecycle logger lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        upstream = %config.upstream.url,
        pool_size = config.pool.size,
        bootstrap_timeout_secs = config.pool.bootstrap_timeout.as_secs(),
        request_timeout_secs = config.connection.request_timeout.as_secs(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
