//! Broadcast hub
//!
//! Owns the channel between the feed task and a single fan-out task. The
//! fan-out task pushes every value onto each subscriber's own outbound
//! queue, so one slow or dead subscriber never holds up the others.

use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_core::{AveragePrice, RelayError, RelayResult};

use super::registry::{DeliveryError, SubscriberId, SubscriberRegistry};

/// What to do when a subscriber's outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Remove the lagging subscriber and close its connection
    #[default]
    Disconnect,
    /// Skip this value for the lagging subscriber only
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            "drop_newest" | "drop-newest" | "drop" => Ok(OverflowPolicy::DropNewest),
            _ => Err(format!("Unknown overflow policy: {}", s)),
        }
    }
}

/// Outcome of delivering one value to the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    /// Values skipped under `OverflowPolicy::DropNewest`
    pub dropped: usize,
    /// Subscribers removed during this cycle
    pub removed: Vec<SubscriberId>,
}

/// Hub counters for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HubHealth {
    pub live_subscribers: usize,
    pub published: u64,
    pub fan_out_cycles: u64,
    pub subscribers_removed: u64,
    pub values_dropped: u64,
    pub overflow_policy: OverflowPolicy,
}

#[derive(Debug, Default)]
struct HubStats {
    published: AtomicU64,
    fan_out_cycles: AtomicU64,
    subscribers_removed: AtomicU64,
    values_dropped: AtomicU64,
}

/// State shared with the fan-out task (everything but the sender)
#[derive(Debug)]
struct FanOut {
    registry: Arc<SubscriberRegistry>,
    overflow_policy: OverflowPolicy,
    stats: HubStats,
}

impl FanOut {
    fn deliver(&self, price: AveragePrice) -> FanOutReport {
        let mut report = FanOutReport::default();

        for subscriber in self.registry.snapshot() {
            let id = subscriber.id();
            match subscriber.try_deliver(price) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::QueueFull)
                    if self.overflow_policy == OverflowPolicy::DropNewest =>
                {
                    debug!("[Hub] Queue full for {}, dropping value", id);
                    report.dropped += 1;
                }
                Err(e) => {
                    // The connection handler may have removed it first
                    if self.registry.remove(id) {
                        warn!("[Hub] Removing {} after failed delivery: {:?}", id, e);
                        report.removed.push(id);
                    }
                }
            }
        }

        self.stats.fan_out_cycles.fetch_add(1, Ordering::Relaxed);
        self.stats
            .subscribers_removed
            .fetch_add(report.removed.len() as u64, Ordering::Relaxed);
        self.stats
            .values_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);

        report
    }
}

/// Single-producer channel plus a dedicated fan-out task.
///
/// Clones share the same channel. The fan-out task exits once every clone
/// has been dropped and the queued values are delivered.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    price_tx: mpsc::UnboundedSender<AveragePrice>,
    fan_out: Arc<FanOut>,
}

impl BroadcastHub {
    /// Create a hub; pass the returned receiver to [`BroadcastHub::start`].
    ///
    /// The channel is unbounded so the feed reader never waits on
    /// subscribers; bounding happens per subscriber instead.
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        overflow_policy: OverflowPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<AveragePrice>) {
        let (price_tx, price_rx) = mpsc::unbounded_channel();

        (
            Self {
                price_tx,
                fan_out: Arc::new(FanOut {
                    registry,
                    overflow_policy,
                    stats: HubStats::default(),
                }),
            },
            price_rx,
        )
    }

    /// Spawn the fan-out task
    pub fn start(&self, mut price_rx: mpsc::UnboundedReceiver<AveragePrice>) -> JoinHandle<()> {
        let fan_out = Arc::clone(&self.fan_out);

        tokio::spawn(async move {
            info!(
                "[Hub] Fan-out task started (overflow policy: {:?})",
                fan_out.overflow_policy
            );

            while let Some(price) = price_rx.recv().await {
                let report = fan_out.deliver(price);
                debug!(
                    "[Hub] Delivered {} to {} subscriber(s), dropped {}, removed {}",
                    price,
                    report.delivered,
                    report.dropped,
                    report.removed.len()
                );
            }

            info!("[Hub] Price channel closed, fan-out task exiting");
        })
    }

    /// Queue a value for fan-out
    pub fn publish(&self, price: AveragePrice) -> RelayResult<()> {
        self.price_tx
            .send(price)
            .map_err(|_| RelayError::channel_closed("fan-out task is not running"))?;
        self.fan_out.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Deliver one value to the current registry snapshot, bypassing the channel
    pub fn fan_out(&self, price: AveragePrice) -> FanOutReport {
        self.fan_out.deliver(price)
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.fan_out.registry
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.fan_out.overflow_policy
    }

    pub fn health(&self) -> HubHealth {
        let stats = &self.fan_out.stats;
        HubHealth {
            live_subscribers: self.fan_out.registry.len(),
            published: stats.published.load(Ordering::Relaxed),
            fan_out_cycles: stats.fan_out_cycles.load(Ordering::Relaxed),
            subscribers_removed: stats.subscribers_removed.load(Ordering::Relaxed),
            values_dropped: stats.values_dropped.load(Ordering::Relaxed),
            overflow_policy: self.fan_out.overflow_policy,
        }
    }
}
