//! Binance integration for the depth relay
//!
//! This crate provides the upstream side of the relay: a WebSocket
//! connector for Binance's public diff-depth stream, which requires no
//! authentication, and the decoder that turns raw stream frames into
//! `DepthUpdate` records.

pub mod types;
pub mod websocket;

pub use types::{decode_frame, DepthUpdateMessage};
pub use websocket::{
    BinanceFeedConnection, BinanceFeedConnector, BinanceWebSocketConfig, ReconnectPolicy,
    BINANCE_DEPTH_WS_URL,
};
