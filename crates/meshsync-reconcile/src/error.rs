//! Error types for local actions on reconciled state.

use thiserror::Error;

use meshsync_core::{ObjectId, PeerId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The local player already occupies something else.
    #[error("already occupying {0}")]
    AlreadyOccupied(ObjectId),

    /// Another participant holds the object.
    #[error("object {object_id} is held by {holder}")]
    ObjectHeld { object_id: ObjectId, holder: PeerId },

    /// Released an object the local player does not occupy.
    #[error("not occupying {0}")]
    NotOccupying(ObjectId),
}

/// Result type for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
