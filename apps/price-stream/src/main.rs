//! Price Stream Server Binary
//!
//! Starts the replay-then-live price streaming service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-stream
//! ```
//!
//! # Environment Variables
//!
//! - `PRICE_STREAM_BACKEND`: redis | memory (default: redis)
//! - `REDIS_ADDR`, `REDIS_PASSWORD`, `REDIS_DB`: History cache connection
//! - `BROKER_URL`: Pub/sub broker URL (default: <redis://redis:6379/0>)
//! - `PRICE_STREAM_CHANNEL_PREFIX`: Fanout channel prefix (default: btcprice)
//! - `PRICE_STREAM_POLL_INTERVAL_MS`: Upstream poll interval, at least 1000 (default: 5000)
//! - `PRICE_STREAM_QUOTE_URL`: Quote provider endpoint
//! - `PRICE_STREAM_FETCH_TIMEOUT_SECS`: Upstream request timeout (default: 10)
//! - `PRICE_STREAM_GRPC_PORT`: gRPC server port (default: 50051)
//! - `PRICE_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8081)
//! - `PRICE_STREAM_MAX_SUBSCRIPTIONS`: Concurrent subscription cap (default: 1024)
//! - `PRICE_STREAM_DELIVERY_BUFFER`: Per-subscription buffer (default: 256)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use price_stream::infrastructure::coindesk::CoindeskPriceSource;
use price_stream::infrastructure::grpc::proto::price::v1::price_service_server::PriceServiceServer;
use price_stream::infrastructure::redis::{RedisFanout, RedisHistoryStore};
use price_stream::infrastructure::telemetry;
use price_stream::{
    Backend, Backends, BroadcastFanout, HealthServer, HealthServerState, InMemoryHistoryStore,
    PriceStreamServer, StreamConfig, SubscriptionCoordinator, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting price stream");

    let _metrics_handle = init_metrics();

    let config = StreamConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let backends = build_backends(&config).await?;
    let coordinator = Arc::new(SubscriptionCoordinator::new(backends, config.pipeline()));

    let grpc_server = Arc::new(PriceStreamServer::new(
        Arc::clone(&coordinator),
        config.grpc(),
        shutdown_token.clone(),
    ));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        config.backend,
        Arc::clone(&coordinator),
        Arc::clone(&grpc_server),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.server.grpc_port));
    let grpc_service = PriceServiceServer::from_arc(grpc_server);
    let grpc_shutdown = shutdown_token.clone();

    let grpc_task = tokio::spawn(async move {
        tracing::info!(addr = %grpc_addr, "gRPC server listening");
        if let Err(e) = Server::builder()
            .add_service(grpc_service)
            .serve_with_shutdown(grpc_addr, grpc_shutdown.cancelled())
            .await
        {
            tracing::error!(error = %e, "gRPC server error");
        }
        tracing::info!("gRPC server stopped");
    });

    health_state.set_ready(true);
    tracing::info!("Price stream ready");

    await_shutdown(&shutdown_token).await;

    health_state.set_ready(false);
    coordinator.shutdown();
    if let Err(e) = grpc_task.await {
        tracing::error!(error = %e, "gRPC server task panicked");
    }

    tracing::info!("Price stream stopped");
    Ok(())
}

/// Build the history store, fanout and price source for the configured backend.
async fn build_backends(config: &StreamConfig) -> anyhow::Result<Backends> {
    let source = CoindeskPriceSource::new(&config.poll.quote_url, config.poll.fetch_timeout)
        .context("failed to build quote provider client")?;

    let backends = match config.backend {
        Backend::Redis => {
            let store = RedisHistoryStore::connect(&config.redis.url())
                .await
                .context("failed to connect to history store")?;
            store.ping().await.context("history store did not answer")?;
            let fanout = RedisFanout::connect(&config.broker.url, &config.broker.channel_prefix)
                .await
                .context("failed to connect to fanout broker")?;
            Backends {
                source: Arc::new(source),
                store: Arc::new(store),
                fanout: Arc::new(fanout),
            }
        }
        Backend::Memory => {
            tracing::warn!("Using in-memory backends, history is lost on restart");
            Backends {
                source: Arc::new(source),
                store: Arc::new(InMemoryHistoryStore::new()),
                fanout: Arc::new(BroadcastFanout::with_defaults()),
            }
        }
    };
    Ok(backends)
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        backend = config.backend.as_str(),
        grpc_port = config.server.grpc_port,
        health_port = config.server.health_port,
        poll_interval_ms = u64::try_from(config.poll.interval.as_millis()).unwrap_or(u64::MAX),
        max_subscriptions = config.subscriptions.max_subscriptions,
        "Configuration loaded"
    );
    tracing::debug!(
        redis = ?config.redis,
        broker_url = %config.broker.url,
        channel_prefix = %config.broker.channel_prefix,
        quote_url = %config.poll.quote_url,
        "Backend endpoints"
    );
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

/// Wait for SIGINT or SIGTERM, then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: &CancellationToken) {
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
                tracing::error!(error = %e, "SIGTERM handler failed");
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
    tracing::info!("Graceful shutdown started");
}
