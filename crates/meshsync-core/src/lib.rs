//! # Meshsync Core
//!
//! Pure primitives shared by every meshsync crate: identifiers, the JSON wire
//! envelope, per-peer state, full-state snapshots, and a generation-checked
//! timer queue.
//!
//! This crate contains no I/O and no networking. Every time-dependent API
//! takes an explicit `now` in milliseconds so the layers above can be driven
//! deterministically.
//!
//! ## Key Types
//!
//! - [`PeerId`] - Identity of a participant; ordered numerically when possible
//! - [`PeerMessage`] - Mesh (and relay-forwarded) peer-to-peer messages
//! - [`RelayMessage`] / [`ClientMessage`] - Relay channel frames
//! - [`PeerSyncState`] - Everything known locally about one peer
//! - [`FullStateSnapshot`] - Self-describing resync payload
//! - [`TimerQueue`] - Deferred work with explicit cancellation
//!
//! ## Wire Format
//!
//! Every frame is a UTF-8 JSON object `{"type": ..., "payload": {...}}`. See
//! [`message`].

pub mod error;
pub mod message;
pub mod snapshot;
pub mod state;
pub mod timer;
pub mod types;

pub use error::{CoreError, Result};
pub use message::{
    decode_frame, encode_frame, ClaimKind, ClaimPayload, ClientMessage, EntityBatch,
    IceCredentials, PeerMessage, PositionPayload, RelayMessage, SignalPayload,
};
pub use snapshot::FullStateSnapshot;
pub use state::{
    CargoItem, ClimbPhase, HarvestActivity, Identity, Occupancy, OccupancyKind, PeerSyncState,
    Spatial,
};
pub use timer::{TimerId, TimerQueue};
pub use types::{CellKey, Millis, ObjectId, PeerId, Vec3};
