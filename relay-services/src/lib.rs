//! Business logic services for the depth relay
//!
//! This crate turns decoded depth updates into average prices and fans
//! them out to every connected WebSocket subscriber.

pub mod price_aggregator;
pub mod relay;
pub mod websocket;

pub use price_aggregator::{PriceAggregator, PriceParsePolicy};
pub use relay::{FeedMetrics, PriceRelay};
pub use websocket::{
    BroadcastHub, ConnectionLifecycleManager, DeliveryError, DisconnectReason, FanOutReport, HubHealth,
    OverflowPolicy, Subscriber, SubscriberConfig, SubscriberId, SubscriberRegistry,
};
