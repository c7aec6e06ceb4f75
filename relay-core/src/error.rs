//! Error types for the relay

use thiserror::Error;

/// Relay-wide error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Feed read error: {0}")]
    FeedRead(String),

    #[error("Feed closed by upstream")]
    FeedClosed,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Subscriber write error ({subscriber}): {message}")]
    SubscriberWrite { subscriber: String, message: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn connect(msg: impl Into<String>) -> Self {
        RelayError::Connect(msg.into())
    }

    pub fn feed_read(msg: impl Into<String>) -> Self {
        RelayError::FeedRead(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        RelayError::Parse(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        RelayError::Decode(msg.into())
    }

    pub fn subscriber_write(subscriber: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::SubscriberWrite {
            subscriber: subscriber.into(),
            message: message.into(),
        }
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        RelayError::ChannelClosed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    /// Whether this error means the upstream connection is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RelayError::FeedRead(_) | RelayError::FeedClosed)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Parse(err.to_string())
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
