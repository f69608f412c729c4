//! # Meshsync Reconcile
//!
//! Turns inbound peer messages into locally-consistent per-peer state.
//!
//! ## Overview
//!
//! The [`StateReconciler`] is a reducer: each call mutates the addressed
//! [`PeerSyncState`](meshsync_core::PeerSyncState) and returns the
//! [`ReconcileEffect`]s that rendering and audio collaborators should act on.
//! It performs no I/O.
//!
//! ## Key Properties
//!
//! - **Lazy representation**: identity, position, and full-state messages are
//!   stored even when no avatar exists yet, so an avatar created later starts
//!   from current state instead of defaults.
//! - **Idempotent snapshots**: each sub-state is compared independently
//!   (absent/absent, construct, tear down, update targets); re-applying an
//!   unchanged snapshot constructs and tears down nothing.
//! - **Symmetric arbitration**: shared-object conflicts and retry elimination
//!   are decided from inputs both sides already hold, so every observer
//!   reaches the same verdict without exchanging messages.

pub mod effects;
pub mod error;
pub mod reconciler;
pub mod snapshot;
pub mod tiebreak;

pub use effects::{ReconcileEffect, SubState};
pub use error::{ReconcileError, Result};
pub use reconciler::{ReconcilerConfig, StateReconciler};
pub use tiebreak::{arbitrate_elimination, claim_winner, EliminationVerdict, Participant};
