//! WebSocket infrastructure for pushing average prices
//!
//! This module provides the subscriber registry, the broadcast hub that
//! fans values out to it, and the per-connection lifecycle handling.

mod handler;
mod hub;
mod registry;

pub use handler::{ConnectionLifecycleManager, DisconnectReason, SubscriberConfig};
pub use hub::{BroadcastHub, FanOutReport, HubHealth, OverflowPolicy};
pub use registry::{DeliveryError, Subscriber, SubscriberId, SubscriberRegistry};
