//! Error types for the transport module.

use thiserror::Error;

use meshsync_core::CoreError;

/// Errors that can occur in socket and channel operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying socket refused the operation.
    #[error("socket error: {0}")]
    Socket(String),

    /// The data channel is no longer writable.
    #[error("channel closed")]
    ChannelClosed,

    /// Frame encoding failed.
    #[error("frame error: {0}")]
    Frame(#[from] CoreError),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
