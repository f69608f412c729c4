//! # Meshsync
//!
//! Networking and state reconciliation for a shared live world: one
//! authoritative relay connection plus a mesh of direct peer links, glued
//! together by a session orchestrator.
//!
//! ## Overview
//!
//! - **Relay**: a single reliable channel with a fingerprint handshake,
//!   fixed-interval reconnects, and a liveness watchdog.
//! - **Mesh**: one data channel per nearby peer, negotiated direct-first with a
//!   relay-candidate fallback on retry.
//! - **Orchestration**: bounded per-peer retries, symmetric elimination when
//!   they run out, and suppression windows around deaths and respawns.
//! - **Reconciliation**: lazy avatar creation, idempotent full-state snapshots,
//!   and deterministic arbitration of shared-object claims.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshsync::{ConnectionOrchestrator, MeshsyncConfig, SessionEvent};
//! use meshsync::transport::{Fingerprint, MemoryRelaySocket};
//!
//! let socket = MemoryRelaySocket::new();
//! let fingerprint = Fingerprint::derive(&["linux", "1920x1080"]);
//! let mut session = ConnectionOrchestrator::new(socket, fingerprint, MeshsyncConfig::default());
//!
//! session.events().subscribe(|event| {
//!     if let SessionEvent::PeerConnected { peer_id, .. } = event {
//!         println!("linked to {peer_id}");
//!     }
//! });
//! session.connect("wss://relay.example", 0);
//! ```
//!
//! In an application, hand the orchestrator to a [`Driver`] to run it on a
//! tokio `LocalSet`.
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `meshsync::core` - Identifiers, wire messages, per-peer state, timers
//! - `meshsync::transport` - Relay and mesh transports, message queue
//! - `meshsync::reconcile` - State reconciler and arbitration rules

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod hooks;
pub mod orchestrator;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-export component crates
pub use meshsync_core as core;
pub use meshsync_reconcile as reconcile;
pub use meshsync_transport as transport;

// Re-export main types for convenience
pub use config::{MeshsyncConfig, RetryConfig, SyncConfig};
pub use driver::{
    ChannelInput, Driver, DriverHandle, MeshConnector, NegotiatedLink, RelaySocketEvent,
    SignalChannel,
};
pub use error::{MeshsyncError, Result};
pub use events::{EventBus, EventKind, SessionEvent, SessionEventKind, SubscriptionId};
pub use hooks::{EntitySyncSource, WorldRegistry};
pub use orchestrator::{ConnectionOrchestrator, NegotiationCommand};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketRelaySocket;

// Re-export commonly used core types
pub use meshsync_core::{
    ClaimKind, ClimbPhase, FullStateSnapshot, Identity, Millis, ObjectId, PeerId, PeerMessage,
    Vec3,
};
pub use meshsync_reconcile::{ReconcileEffect, SubState};
