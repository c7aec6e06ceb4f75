//! Upstream feed abstraction
//!
//! The relay only needs two things from an upstream: a way to connect and
//! a blocking "next frame" read on the resulting connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::RelayResult;

/// Opens connections to a fixed upstream endpoint
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Human-readable endpoint for logging
    fn endpoint(&self) -> &str;

    /// Establish a new upstream connection
    async fn connect(&self) -> RelayResult<Box<dyn FeedConnection>>;
}

/// A live upstream connection
#[async_trait]
pub trait FeedConnection: Send {
    /// Wait for the next raw text frame.
    ///
    /// Returns `RelayError::FeedClosed` or `RelayError::FeedRead` once the
    /// connection is gone; the caller must not read again after that.
    async fn next_frame(&mut self) -> RelayResult<String>;
}

/// Health snapshot for the upstream feed
#[derive(Debug, Clone, Serialize)]
pub struct FeedHealth {
    pub endpoint: String,
    pub connected: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub updates_published: u64,
    pub reconnect_attempts: u32,
    pub is_stale: bool,
}
