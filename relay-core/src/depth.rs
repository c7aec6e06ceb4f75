//! Depth update and average price types
//!
//! A `DepthUpdate` is one decoded upstream frame; an `AveragePrice` is the
//! scalar derived from it and pushed to subscribers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event type discriminator of the depth stream
pub const DEPTH_UPDATE_EVENT: &str = "depthUpdate";

/// One price level as sent upstream: decimal text, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub quantity: String,
}

impl PriceLevel {
    pub fn new(price: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            quantity: quantity.into(),
        }
    }
}

/// A decoded order book depth update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// Event type, always `depthUpdate` once decoded
    pub event_type: String,

    /// Final update id in this event (`u`)
    pub update_id: i64,

    /// First update id in this event (`U`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_update_id: Option<i64>,

    /// Event time in milliseconds (`E`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<i64>,

    /// Trading symbol (`s`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,

    /// Bid levels in upstream order
    pub bids: Vec<PriceLevel>,

    /// Ask levels in upstream order
    pub asks: Vec<PriceLevel>,
}

impl DepthUpdate {
    pub fn new(update_id: i64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            event_type: DEPTH_UPDATE_EVENT.to_string(),
            update_id,
            first_update_id: None,
            event_time: None,
            symbol: None,
            bids,
            asks,
        }
    }

    /// Total number of price levels (bids + asks)
    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    /// All levels, bids first then asks
    pub fn levels(&self) -> impl Iterator<Item = &PriceLevel> {
        self.bids.iter().chain(self.asks.iter())
    }
}

/// Unweighted mean of every bid and ask price in one depth update.
///
/// Serializes as a bare JSON number.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AveragePrice(pub f64);

impl AveragePrice {
    pub fn value(self) -> f64 {
        self.0
    }

    /// Encode as the JSON text pushed to subscribers
    pub fn to_json(self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self)
    }
}

impl From<f64> for AveragePrice {
    fn from(value: f64) -> Self {
        AveragePrice(value)
    }
}

impl fmt::Display for AveragePrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}
