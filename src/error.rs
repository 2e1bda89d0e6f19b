//! Error definitions for the Home Assistant bridge

use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the bridge
///
/// No public bridge operation panics or propagates a foreign error type; every
/// failure ends up as one of these variants or as a log line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A required config field is missing, nothing was attempted
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Transport-level failure reported by the MQTT client
    #[error("Connection error: {0}")]
    Connection(String),

    /// An outbound packet was dropped because the client is not connected
    #[error("Publish skipped, not connected: {0}")]
    PublishSkipped(String),

    /// Inbound topic or payload could not be interpreted
    #[error("Unparseable inbound message on {topic}: {reason}")]
    ParseFailure { topic: String, reason: String },

    /// Inbound select command referenced a profile that no longer exists
    #[error("Unknown profile name: {0}")]
    UnknownProfileName(String),

    /// The key-value store failed to read or write
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Config could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The bridge actor is gone
    #[error("Channel error: {0}")]
    ChannelClosed(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}
