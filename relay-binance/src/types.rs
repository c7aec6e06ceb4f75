//! Binance diff-depth stream message types
//!
//! Frames on the `<symbol>@depth` stream look like:
//!
//! ```json
//! {"e":"depthUpdate","E":1672515782136,"s":"BTCUSDT","U":157,"u":160,
//!  "b":[["0.0024","10"]],"a":[["0.0026","100"]]}
//! ```

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use relay_core::{DepthUpdate, PriceLevel, RelayError, RelayResult, DEPTH_UPDATE_EVENT};

/// Raw `depthUpdate` event as sent by Binance
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdateMessage {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: Option<i64>,
    #[serde(rename = "s")]
    pub symbol: Option<String>,
    #[serde(rename = "U")]
    pub first_update_id: Option<i64>,
    /// Missing ids decode as 0
    #[serde(rename = "u", default)]
    pub final_update_id: i64,
    /// `[price, quantity]` entries, kept as raw JSON so one odd level
    /// cannot reject the whole update
    #[serde(rename = "b", default)]
    pub bids: Option<Vec<Value>>,
    #[serde(rename = "a", default)]
    pub asks: Option<Vec<Value>>,
}

/// Text at `index` of a level entry, or `""` when it is missing or not a
/// string. Empty text never parses as a price.
fn level_field(level: &Value, index: usize) -> String {
    level
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn to_levels(levels: Option<Vec<Value>>) -> Vec<PriceLevel> {
    levels
        .unwrap_or_default()
        .iter()
        .map(|level| PriceLevel {
            price: level_field(level, 0),
            quantity: level_field(level, 1),
        })
        .collect()
}

impl From<DepthUpdateMessage> for DepthUpdate {
    fn from(msg: DepthUpdateMessage) -> Self {
        DepthUpdate {
            event_type: msg.event_type,
            update_id: msg.final_update_id,
            first_update_id: msg.first_update_id,
            event_time: msg.event_time,
            symbol: msg.symbol,
            bids: to_levels(msg.bids),
            asks: to_levels(msg.asks),
        }
    }
}

/// Decode one raw stream frame.
///
/// Frames whose `e` field is not `depthUpdate` (or have no `e` at all) are
/// ignored and yield `Ok(None)`. Frames that are not JSON, or depth updates
/// whose header fields have the wrong type, yield `RelayError::Parse`.
///
/// Price and quantity text is passed through untouched; numeric parsing is
/// the aggregator's job. A level whose price is missing or not a string
/// still counts, with empty price text.
pub fn decode_frame(frame: &str) -> RelayResult<Option<DepthUpdate>> {
    let json: Value = serde_json::from_str(frame)
        .map_err(|e| RelayError::parse(format!("frame is not valid JSON: {}", e)))?;

    let event_type = json.get("e").and_then(|v| v.as_str());
    if event_type != Some(DEPTH_UPDATE_EVENT) {
        debug!("[Binance WS] Ignoring event type {:?}", event_type);
        return Ok(None);
    }

    let msg: DepthUpdateMessage = serde_json::from_value(json)
        .map_err(|e| RelayError::parse(format!("malformed depthUpdate: {}", e)))?;

    Ok(Some(msg.into()))
}
