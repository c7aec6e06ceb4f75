//! Price relay
//!
//! Supervises the upstream feed connection and, on the same task, decodes
//! each frame, aggregates it and hands the result to the broadcast hub.
//! Connection failures are retried with backoff instead of stopping the
//! process; feed health stays observable while reconnecting.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use relay_binance::{decode_frame, ReconnectPolicy};
use relay_core::{AveragePrice, FeedConnection, FeedConnector, FeedHealth, RelayError, RelayResult};

use crate::websocket::BroadcastHub;
use crate::PriceAggregator;

/// Stale threshold - if no message for this duration, consider the feed stale
const STALE_THRESHOLD_SECS: u64 = 60;

/// Health metrics for the feed connection (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct FeedMetrics {
    connected: AtomicBool,
    last_message_epoch_ms: AtomicU64,
    message_count: AtomicU64,
    updates_published: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::SeqCst);
    }

    fn record_message(&self) {
        self.last_message_epoch_ms.store(now_ms(), Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    fn record_published(&self) {
        self.updates_published.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn updates_published(&self) -> u64 {
        self.updates_published.load(Ordering::SeqCst)
    }

    pub fn get_health(&self, endpoint: &str) -> FeedHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let last_ms = self.last_message_epoch_ms.load(Ordering::SeqCst);

        let last_message_time = if last_ms > 0 {
            DateTime::from_timestamp(
                (last_ms / 1000) as i64,
                ((last_ms % 1000) * 1_000_000) as u32,
            )
        } else {
            None
        };

        let is_stale = if connected && last_ms > 0 {
            now_ms().saturating_sub(last_ms) > STALE_THRESHOLD_SECS * 1000
        } else {
            !connected
        };

        FeedHealth {
            endpoint: endpoint.to_string(),
            connected,
            last_message_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            updates_published: self.updates_published.load(Ordering::SeqCst),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            is_stale,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Feed reader: connect, decode, aggregate, publish
pub struct PriceRelay {
    connector: Arc<dyn FeedConnector>,
    aggregator: PriceAggregator,
    hub: BroadcastHub,
    reconnect: ReconnectPolicy,
    metrics: Arc<FeedMetrics>,
}

impl PriceRelay {
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        aggregator: PriceAggregator,
        hub: BroadcastHub,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            connector,
            aggregator,
            hub,
            reconnect,
            metrics: Arc::new(FeedMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn health(&self) -> FeedHealth {
        self.metrics.get_health(self.connector.endpoint())
    }

    /// Run until shutdown is signalled (or the sender is dropped).
    ///
    /// Returns the last connection error if the reconnect policy gives up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RelayResult<()> {
        let endpoint = self.connector.endpoint().to_string();
        let mut attempt = 0u32;

        info!("[Relay] Starting feed relay for {}", endpoint);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown.changed() => break,
            };

            let last_error = match connected {
                Ok(mut connection) => {
                    attempt = 0;
                    self.metrics.set_reconnect_attempts(0);
                    self.metrics.set_connected(true);

                    let lost = tokio::select! {
                        err = self.pump(connection.as_mut()) => err,
                        _ = shutdown.changed() => {
                            self.metrics.set_connected(false);
                            break;
                        }
                    };

                    self.metrics.set_connected(false);
                    warn!("[Relay] Upstream connection lost: {}", lost);
                    lost
                }
                Err(e) => {
                    error!("[Relay] Connection to {} failed: {}", endpoint, e);
                    e
                }
            };

            attempt += 1;
            self.metrics.set_reconnect_attempts(attempt);

            if !self.reconnect.allows(attempt) {
                error!(
                    "[Relay] Max reconnect attempts reached, no further updates will be relayed"
                );
                return Err(last_error);
            }

            let delay = self.reconnect.delay_for(attempt);
            info!("[Relay] Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("[Relay] Feed relay stopped");
        Ok(())
    }

    /// Read frames until the connection fails; returns that failure
    async fn pump(&self, connection: &mut dyn FeedConnection) -> RelayError {
        loop {
            match connection.next_frame().await {
                Ok(frame) => {
                    self.metrics.record_message();
                    self.process_frame(&frame);
                }
                Err(e) => return e,
            }
        }
    }

    /// Decode, aggregate and publish one raw frame.
    ///
    /// Returns the published price, if any. Bad frames are logged and
    /// skipped; they never end the feed.
    pub fn process_frame(&self, frame: &str) -> Option<AveragePrice> {
        let update = match decode_frame(frame) {
            Ok(Some(update)) => update,
            Ok(None) => return None,
            Err(e) => {
                warn!("[Relay] Skipping frame: {}", e);
                return None;
            }
        };

        let price = match self.aggregator.average(&update) {
            Ok(Some(price)) => price,
            Ok(None) => {
                debug!("[Relay] Update {} has no levels, nothing to emit", update.update_id);
                return None;
            }
            Err(e) => {
                warn!("[Relay] Skipping update {}: {}", update.update_id, e);
                return None;
            }
        };

        debug!("[Relay] Average price for update {}: {}", update.update_id, price);

        if let Err(e) = self.hub.publish(price) {
            error!("[Relay] Failed to publish average price: {}", e);
            return None;
        }

        self.metrics.record_published();
        Some(price)
    }
}

impl std::fmt::Debug for PriceRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceRelay")
            .field("endpoint", &self.connector.endpoint())
            .field("aggregator", &self.aggregator)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{OverflowPolicy, SubscriberRegistry};
    use crate::PriceParsePolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Each `connect` pops one scripted session
    struct ScriptedConnector {
        sessions: Mutex<VecDeque<Option<Vec<String>>>>,
        connects: AtomicU32,
    }

    impl ScriptedConnector {
        fn new(sessions: Vec<Option<Vec<&str>>>) -> Self {
            let sessions = sessions
                .into_iter()
                .map(|s| s.map(|frames| frames.into_iter().map(String::from).collect()))
                .collect();
            Self {
                sessions: Mutex::new(sessions),
                connects: AtomicU32::new(0),
            }
        }
    }

    struct ScriptedConnection {
        frames: VecDeque<String>,
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        fn endpoint(&self) -> &str {
            "scripted://feed"
        }

        async fn connect(&self) -> RelayResult<Box<dyn FeedConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front().flatten() {
                Some(frames) => Ok(Box::new(ScriptedConnection {
                    frames: frames.into(),
                })),
                None => Err(RelayError::connect("connection refused")),
            }
        }
    }

    #[async_trait]
    impl FeedConnection for ScriptedConnection {
        async fn next_frame(&mut self) -> RelayResult<String> {
            self.frames.pop_front().ok_or(RelayError::FeedClosed)
        }
    }

    fn fast_reconnect(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            delay_base: Duration::from_millis(1),
            delay_max: Duration::from_millis(5),
            max_attempts: Some(max_attempts),
            jitter: false,
        }
    }

    fn relay_with(
        connector: Arc<ScriptedConnector>,
        reconnect: ReconnectPolicy,
    ) -> (PriceRelay, Arc<SubscriberRegistry>, mpsc::UnboundedReceiver<AveragePrice>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let (hub, price_rx) = BroadcastHub::new(Arc::clone(&registry), OverflowPolicy::Disconnect);
        let relay = PriceRelay::new(connector, PriceAggregator::default(), hub, reconnect);
        (relay, registry, price_rx)
    }

    const DEPTH: &str = r#"{"e":"depthUpdate","u":1,"b":[["100.0","1"],["99.5","2"]],"a":[["100.5","1"]]}"#;
    const TRADE: &str = r#"{"e":"trade","u":2,"p":"1.0"}"#;
    const EMPTY: &str = r#"{"e":"depthUpdate","u":3,"b":[],"a":[]}"#;

    #[test]
    fn test_process_frame_publishes_average() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let (relay, _registry, mut price_rx) = relay_with(connector, fast_reconnect(1));

        assert_eq!(relay.process_frame(DEPTH), Some(AveragePrice(100.0)));
        assert_eq!(price_rx.try_recv().unwrap(), AveragePrice(100.0));
        assert_eq!(relay.metrics().updates_published(), 1);
    }

    #[test]
    fn test_process_frame_skips_other_events_and_garbage() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let (relay, _registry, mut price_rx) = relay_with(connector, fast_reconnect(1));

        assert_eq!(relay.process_frame(TRADE), None);
        assert_eq!(relay.process_frame(EMPTY), None);
        assert_eq!(relay.process_frame("{not json"), None);
        assert!(price_rx.try_recv().is_err());
    }

    #[test]
    fn test_odd_levels_count_as_zero() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let (relay, _registry, mut price_rx) = relay_with(connector, fast_reconnect(1));

        let frame = r#"{"e":"depthUpdate","u":5,"b":[[null,"1"],["90.0"]],"a":[["120.0","1"]]}"#;
        assert_eq!(relay.process_frame(frame), Some(AveragePrice(70.0)));
        assert_eq!(price_rx.try_recv().unwrap(), AveragePrice(70.0));
    }

    #[test]
    fn test_reject_policy_skips_update() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (hub, mut price_rx) = BroadcastHub::new(registry, OverflowPolicy::Disconnect);
        let relay = PriceRelay::new(
            Arc::new(ScriptedConnector::new(vec![])),
            PriceAggregator::new(PriceParsePolicy::RejectUpdate),
            hub,
            fast_reconnect(1),
        );

        let frame = r#"{"e":"depthUpdate","u":9,"b":[["x","1"]],"a":[["1","1"]]}"#;
        assert_eq!(relay.process_frame(frame), None);
        assert!(price_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnects_and_preserves_order() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Some(vec![DEPTH, TRADE]),
            None,
            Some(vec![r#"{"e":"depthUpdate","u":4,"b":[["1","1"]],"a":[["3","1"]]}"#]),
        ]));
        let (relay, _registry, mut price_rx) =
            relay_with(Arc::clone(&connector), fast_reconnect(3));
        let metrics = relay.metrics();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(2), relay.run(shutdown_rx))
            .await
            .expect("relay did not give up");

        // Script runs dry after session 3; the fourth consecutive failure is refused
        assert!(matches!(result, Err(RelayError::Connect(_))));
        assert_eq!(price_rx.try_recv().unwrap(), AveragePrice(100.0));
        assert_eq!(price_rx.try_recv().unwrap(), AveragePrice(2.0));
        assert!(price_rx.try_recv().is_err());

        let health = metrics.get_health("scripted://feed");
        assert!(!health.connected);
        assert_eq!(health.message_count, 3);
        assert_eq!(health.updates_published, 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnect_loop() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let reconnect = ReconnectPolicy {
            delay_base: Duration::from_secs(60),
            delay_max: Duration::from_secs(60),
            max_attempts: None,
            jitter: false,
        };
        let (relay, _registry, _price_rx) = relay_with(Arc::clone(&connector), reconnect);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(relay.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("relay ignored shutdown")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }
}
