//! # Meshsync Testkit
//!
//! Testing utilities for meshsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a session wired to an in-memory relay socket, already past
//!   the welcome handshake, with every published event recorded
//! - **Recording hooks**: a world registry and entity source that remember
//!   what they were asked
//! - **Generators**: Proptest strategies for identities, occupancies, and
//!   snapshots
//!
//! ## Test Fixtures
//!
//! ```rust
//! use meshsync_testkit::fixtures::TestFixture;
//! use meshsync::SessionEventKind;
//!
//! let mut fixture = TestFixture::new("1");
//! fixture.proximity(&["2"]);
//! fixture.fail_link("2");
//! assert_eq!(fixture.count(SessionEventKind::PeerRetrying), 1);
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use meshsync_testkit::generators::snapshot;
//!
//! proptest! {
//!     #[test]
//!     fn snapshot_survives_the_wire(s in snapshot()) {
//!         let text = serde_json::to_string(&s).unwrap();
//!         prop_assert_eq!(serde_json::from_str::<_>(&text).ok(), Some(s));
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    frame_types, identity, peer_frame, relay_frame, RecordingRegistry, RegistryCall,
    StaticEntitySource, TestFixture,
};
