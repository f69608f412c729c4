//! Error types for the session layer.

use meshsync_core::CoreError;
use meshsync_reconcile::ReconcileError;
use meshsync_transport::TransportError;
use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum MeshsyncError {
    /// Wire encoding error.
    #[error("frame error: {0}")]
    Core(#[from] CoreError),

    /// Socket or channel error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A local action conflicted with reconciled state.
    #[error("rejected: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// No relay URL has been supplied yet.
    #[error("not connected")]
    NotConnected,

    /// The driver loop is gone.
    #[error("driver stopped")]
    DriverStopped,
}

impl From<serde_json::Error> for MeshsyncError {
    fn from(e: serde_json::Error) -> Self {
        MeshsyncError::Config(e.to_string())
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, MeshsyncError>;
