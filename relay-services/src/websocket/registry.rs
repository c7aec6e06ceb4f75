//! Subscriber registry for WebSocket connections
//!
//! Tracks every live subscriber. Both the connection handlers and the
//! broadcast hub mutate it concurrently, so all access goes through this
//! type; iteration always happens on a copied snapshot.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use relay_core::AveragePrice;

/// Unique identifier for a subscriber connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// Why a value could not be handed to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbound queue is at capacity
    QueueFull,
    /// Writer side is gone
    Closed,
}

/// Handle to one live subscriber connection.
///
/// Cloning is cheap; clones share the outbound queue and close signal.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    /// Bounded queue drained by the connection's writer task
    outbound: mpsc::Sender<AveragePrice>,
    /// Tells the writer task to stop and close the socket
    close_signal: Arc<Notify>,
}

impl Subscriber {
    pub fn new(id: SubscriberId, outbound: mpsc::Sender<AveragePrice>) -> Self {
        Self {
            id,
            outbound,
            close_signal: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue a value without waiting
    pub fn try_deliver(&self, price: AveragePrice) -> Result<(), DeliveryError> {
        self.outbound.try_send(price).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Signal the writer task to close the connection.
    ///
    /// The signal is latched, so it is not lost if the writer is busy.
    pub fn close(&self) {
        self.close_signal.notify_one();
    }

    pub(crate) fn close_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.close_signal)
    }
}

/// Concurrency-safe set of live subscribers
pub struct SubscriberRegistry {
    /// Next subscriber ID to assign
    next_id: AtomicU64,
    subscribers: DashMap<SubscriberId, Subscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: DashMap::new(),
        }
    }

    /// Generate a new unique subscriber ID
    pub fn next_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a subscriber.
    ///
    /// Returns `false` and leaves the existing entry untouched if the ID is
    /// already registered.
    pub fn add(&self, subscriber: Subscriber) -> bool {
        match self.subscribers.entry(subscriber.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!("[Registry] Registered {}", subscriber.id());
                slot.insert(subscriber);
                true
            }
        }
    }

    /// Remove a subscriber and signal its connection to close.
    ///
    /// Returns `true` only for the call that actually removed it; removing
    /// an absent subscriber is a no-op.
    pub fn remove(&self, id: SubscriberId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, subscriber)) => {
                subscriber.close();
                debug!("[Registry] Removed {}", id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Copy of the current members.
    ///
    /// No shard lock is held once this returns, so callers may deliver to
    /// the snapshot while others add or remove concurrently.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<SubscriberId> {
        self.subscribers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("live_subscribers", &self.len())
            .finish()
    }
}
