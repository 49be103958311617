//! Error types for the networking core
//!
//! The taxonomy follows how callers are expected to react:
//! - Configuration errors (`Config`, `DuplicateChannel`, bad addresses) are
//!   fatal at setup time and surface synchronously from constructors.
//! - Transient network errors (`Io`, `Handshake`, `ConnectionClosed`) tear
//!   down the affected connection only; the node keeps running.
//! - Admission rejections (`RateLimited`, `Filtered`) are expected and
//!   counted, not exceptional.
//! - `Canceled` is distinguishable from all of the above so that shutdown is
//!   never mistaken for peer misbehavior.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the networking core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid node ID: {0}")]
    InvalidNodeId(String),

    #[error("invalid node address {0:?}: {1}")]
    InvalidAddress(String, String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel {0} already registered")]
    DuplicateChannel(u8),

    #[error("connection rate limited: {0}")]
    RateLimited(String),

    #[error("connection rejected by filter: {0}")]
    Filtered(String),

    #[error("operation canceled")]
    Canceled,

    #[error("transport is closed")]
    TransportClosed,

    #[error("transport is not listening")]
    NotListening,

    #[error("transport is already listening")]
    AlreadyListening,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("queue is closed")]
    QueueClosed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

impl Error {
    /// Whether the error is a cancellation, as opposed to a real failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
