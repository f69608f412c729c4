//! # Meshsync Transport
//!
//! Connection lifecycle for the two channels every participant holds:
//!
//! - [`ReliableChannelTransport`]: the single authoritative relay connection,
//!   with a fingerprint pre-handshake, fixed-interval reconnects, and a
//!   liveness watchdog.
//! - [`PeerMeshTransport`]: one [`PeerLink`] per nearby peer, negotiated in two
//!   tiers (direct candidates first, relay fallback on retry), with a bounded
//!   handshake timeout and single-serialisation broadcast.
//!
//! Plus the [`MessageQueue`] that decouples relay frame arrival from
//! processing.
//!
//! ## Driving model
//!
//! Nothing here blocks or spawns. Sockets are opened through the
//! [`RelaySocket`] and [`DataChannel`] traits; their completions are fed back
//! through `on_*` methods, and each component exposes `tick(now)` plus
//! `next_deadline()` for its timers. An event loop (see the `meshsync` crate)
//! owns the clock.
//!
//! ```text
//!  socket callbacks ──► on_open / on_frame / on_close ──► RelayEvent
//!  negotiation      ──► on_channel_open / on_data / ... ─► MeshEvent
//!  clock            ──► tick(now) ───────────────────────► events
//! ```

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod mesh;
pub mod queue;
pub mod relay;
pub mod socket;

pub use config::{MeshConfig, RelayConfig};
pub use error::{Result, TransportError};
pub use fingerprint::Fingerprint;
pub use mesh::{
    CandidateType, IceMode, LinkFailure, LinkRole, LinkState, MeshEvent, MeshStats,
    NegotiationRequest, PeerLink, PeerMeshTransport,
};
pub use queue::{MessageQueue, MessageSource, QueuedMessage};
pub use relay::{RelayEvent, RelayState, ReliableChannelTransport};
pub use socket::{
    memory::{MemoryDataChannel, MemoryRelaySocket, SocketLog},
    DataChannel, RelaySocket,
};
