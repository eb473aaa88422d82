//! Feed error types.

use common::Namespace;
use thiserror::Error;

/// Feed error type.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Transport or connection failure.
    #[error("Connection error: {0}")]
    Connection(#[from] common::Error),

    /// REST failure (channel resolution, history, badges, polling).
    #[error("REST error: {0}")]
    Rest(#[from] rest_client::Error),

    /// A pushed event whose payload does not match its contract.
    #[error("Invalid payload for '{event}': {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// A channel was offered to a controller of another namespace.
    #[error("Channel {channel} does not belong to namespace {expected}")]
    NamespaceMismatch { channel: String, expected: Namespace },

    /// An operation that needs a joined room was requested without one.
    #[error("Not joined to any channel")]
    NotJoined,

    /// The feed task has stopped.
    #[error("Feed closed")]
    Closed,
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
