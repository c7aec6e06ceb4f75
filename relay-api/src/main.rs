//! Depth Relay API Server
//!
//! Streams the average price of each Binance depth update to every
//! connected WebSocket subscriber.

mod config;
mod routes;

use anyhow::Context;
use axum::{
    http::{header, Method},
    Router,
};
use relay_binance::BinanceFeedConnector;
use relay_services::{
    BroadcastHub, ConnectionLifecycleManager, FeedMetrics, PriceAggregator, PriceRelay,
    SubscriberRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::RelayConfig;

/// Time allowed for subscriber close frames during shutdown
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: ConnectionLifecycleManager,
    pub hub: BroadcastHub,
    pub feed_metrics: Arc<FeedMetrics>,
    pub feed_endpoint: Arc<str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_api=debug")),
        )
        .init();

    info!("Starting Depth Relay API");

    let config = RelayConfig::from_env().context("invalid configuration")?;
    info!(
        "Feed: {} | overflow policy: {:?} | parse policy: {:?}",
        config.feed_endpoint(),
        config.overflow_policy,
        config.parse_policy
    );

    // Subscribers and fan-out
    let registry = Arc::new(SubscriberRegistry::new());
    let (hub, price_rx) = BroadcastHub::new(Arc::clone(&registry), config.overflow_policy);
    let hub_handle = hub.start(price_rx);
    let lifecycle = ConnectionLifecycleManager::new(Arc::clone(&registry), config.subscriber.clone());

    // Upstream feed
    let connector = BinanceFeedConnector::new(config.feed.clone())?;
    let relay = PriceRelay::new(
        Arc::new(connector),
        PriceAggregator::new(config.parse_policy),
        hub.clone(),
        config.feed.reconnect.clone(),
    );
    let feed_metrics = relay.metrics();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_handle = tokio::spawn(async move {
        if let Err(e) = relay.run(shutdown_rx).await {
            error!("Feed relay gave up: {}", e);
        }
    });

    let state = AppState {
        lifecycle: lifecycle.clone(),
        hub,
        feed_metrics,
        feed_endpoint: Arc::from(config.feed_endpoint()),
    };

    // Configure CORS for browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    // Build router
    let app = Router::new()
        .merge(routes::api_routes())
        .merge(routes::ws_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, shutting down feed relay");
    let _ = shutdown_tx.send(true);
    if let Err(e) = relay_handle.await {
        error!("Feed relay task failed: {}", e);
    }

    // Upgraded sockets outlive the HTTP server; close them explicitly
    let open = registry.ids();
    for id in &open {
        registry.remove(*id);
    }
    if timeout(SHUTDOWN_DRAIN_TIMEOUT, lifecycle.wait_until_idle()).await.is_err() {
        warn!(
            "{} subscriber connection(s) still open after {:?}",
            lifecycle.active_connections(),
            SHUTDOWN_DRAIN_TIMEOUT
        );
    }
    info!("Closed {} subscriber connection(s)", open.len());
    hub_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
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

    info!("Shutdown signal received");
}
