//! Core types for the depth relay
//!
//! This crate defines the shared data structures used across the relay:
//! decoded depth updates, the derived average price, the feed abstraction
//! and the relay-wide error type.

pub mod depth;
pub mod error;
pub mod feed;

pub use depth::{AveragePrice, DepthUpdate, PriceLevel, DEPTH_UPDATE_EVENT};
pub use error::{RelayError, RelayResult};
pub use feed::{FeedConnection, FeedConnector, FeedHealth};
