//! Binance WebSocket client for the diff-depth stream
//!
//! Connects to Binance's public market stream and hands raw text frames to
//! the caller. Reconnection is not done here: the relay supervisor decides
//! when to reconnect, using `ReconnectPolicy` for the delays.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use relay_core::{FeedConnection, FeedConnector, RelayError, RelayResult};

/// Binance BTC/USDT diff-depth stream (public, no auth required)
pub const BINANCE_DEPTH_WS_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@depth";

/// Reconnect delay base
const RECONNECT_DELAY_BASE: Duration = Duration::from_secs(1);

/// Upper bound for a single reconnect delay
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Largest exponent applied to the base delay
const MAX_BACKOFF_EXPONENT: u32 = 16;

// ============================================================================
// Reconnect Policy
// ============================================================================

/// Bounded exponential backoff with jitter
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub delay_base: Duration,
    pub delay_max: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// Randomly shorten each delay by up to 25%
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_base: RECONNECT_DELAY_BASE,
            delay_max: RECONNECT_DELAY_MAX,
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Whether reconnect attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay before attempt `attempt` without jitter: `base * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.delay_base
            .saturating_mul(1u32 << exponent)
            .min(self.delay_max)
    }

    /// Delay before attempt `attempt`, jittered when enabled
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter {
            return delay;
        }

        let factor = rand::rng().random_range(0.75..=1.0);
        delay.mul_f64(factor)
    }
}

// ============================================================================
// Binance Feed Connector
// ============================================================================

/// Configuration for the Binance depth stream
#[derive(Clone, Debug)]
pub struct BinanceWebSocketConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for BinanceWebSocketConfig {
    fn default() -> Self {
        Self {
            url: BINANCE_DEPTH_WS_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Opens connections to the configured Binance stream
#[derive(Debug, Clone)]
pub struct BinanceFeedConnector {
    config: BinanceWebSocketConfig,
}

impl BinanceFeedConnector {
    /// Create a connector, rejecting URLs that are not `ws://` or `wss://`
    pub fn new(config: BinanceWebSocketConfig) -> RelayResult<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| RelayError::config(format!("invalid feed URL {}: {}", config.url, e)))?;

        match url.scheme() {
            "ws" | "wss" => Ok(Self { config }),
            other => Err(RelayError::config(format!(
                "feed URL must use ws or wss, got {}",
                other
            ))),
        }
    }

    pub fn config(&self) -> &BinanceWebSocketConfig {
        &self.config
    }
}

#[async_trait]
impl FeedConnector for BinanceFeedConnector {
    fn endpoint(&self) -> &str {
        &self.config.url
    }

    async fn connect(&self) -> RelayResult<Box<dyn FeedConnection>> {
        info!("[Binance WS] Connecting to {}", self.config.url);

        let (stream, response) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| RelayError::connect(e.to_string()))?;

        info!(
            "[Binance WS] Connected successfully (status {})",
            response.status()
        );

        Ok(Box::new(BinanceFeedConnection { stream }))
    }
}

/// A live connection to the Binance stream
pub struct BinanceFeedConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnection for BinanceFeedConnection {
    async fn next_frame(&mut self) -> RelayResult<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(text),
                    Err(_) => debug!("[Binance WS] Skipping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    // Binance drops connections that miss pongs
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("[Binance WS] Failed to send pong: {}", e);
                        return Err(RelayError::feed_read(e.to_string()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("[Binance WS] Connection closed by server: {:?}", frame);
                    return Err(RelayError::FeedClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(RelayError::feed_read(e.to_string())),
                None => {
                    info!("[Binance WS] Stream ended");
                    return Err(RelayError::FeedClosed);
                }
            }
        }
    }
}

impl std::fmt::Debug for BinanceFeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFeedConnection").finish_non_exhaustive()
    }
}
