//! Error types for meshsync core.

use thiserror::Error;

/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
