//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::cell::RefCell;
use std::rc::Rc;

use meshsync::{
    ConnectionOrchestrator, EntitySyncSource, EventKind, MeshsyncConfig, SessionEvent,
    SessionEventKind, WorldRegistry,
};
use meshsync_core::{encode_frame, CellKey, Identity, Millis, PeerId, PeerMessage, RelayMessage};
use meshsync_transport::{CandidateType, Fingerprint, MemoryDataChannel, MemoryRelaySocket};

/// Relay URL every fixture connects to.
pub const RELAY_URL: &str = "ws://relay.test";

/// One call a [`RecordingRegistry`] received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Update {
        peer_id: PeerId,
        old: Option<CellKey>,
        new: CellKey,
    },
    Remove {
        peer_id: PeerId,
        cell: CellKey,
    },
}

/// World registry that records every call. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingRegistry {
    calls: Rc<RefCell<Vec<RegistryCall>>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls.borrow().clone()
    }
}

impl WorldRegistry for RecordingRegistry {
    fn update_player_cell(&mut self, peer_id: &PeerId, old: Option<CellKey>, new: CellKey) {
        self.calls.borrow_mut().push(RegistryCall::Update {
            peer_id: peer_id.clone(),
            old,
            new,
        });
    }

    fn remove_from_registry(&mut self, peer_id: &PeerId, cell: CellKey) {
        self.calls.borrow_mut().push(RegistryCall::Remove {
            peer_id: peer_id.clone(),
            cell,
        });
    }
}

/// Entity source with a fixed list of entities.
#[derive(Debug, Clone)]
pub struct StaticEntitySource {
    pub kind: String,
    pub entities: Vec<serde_json::Value>,
}

impl StaticEntitySource {
    pub fn new(kind: &str, entities: Vec<serde_json::Value>) -> Self {
        Self {
            kind: kind.to_string(),
            entities,
        }
    }
}

impl EntitySyncSource for StaticEntitySource {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn active_for_sync(&self) -> Vec<serde_json::Value> {
        self.entities.clone()
    }
}

/// A session connected through a memory socket, with a manual clock.
pub struct TestFixture {
    pub session: ConnectionOrchestrator<MemoryRelaySocket>,
    pub socket: MemoryRelaySocket,
    pub registry: RecordingRegistry,
    pub now: Millis,
    events: Rc<RefCell<Vec<SessionEvent>>>,
}

impl TestFixture {
    /// Connected as `local_id` with default configuration.
    pub fn new(local_id: &str) -> Self {
        Self::with_config(local_id, MeshsyncConfig::default())
    }

    /// Connected as `local_id`. Rebroadcast jitter is fixed at zero.
    pub fn with_config(local_id: &str, config: MeshsyncConfig) -> Self {
        let socket = MemoryRelaySocket::new();
        let mut session = ConnectionOrchestrator::with_jitter(
            socket.clone(),
            Fingerprint::derive_with_salt(&["testkit", local_id], b"testkit"),
            config,
            0,
        );

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        session
            .events()
            .subscribe(move |e| sink.borrow_mut().push(e.clone()));

        let registry = RecordingRegistry::new();
        session.set_world_registry(Box::new(registry.clone()));

        session.connect(RELAY_URL, 0);
        session.on_relay_open(0);
        session.on_relay_frame(
            &relay_frame(&RelayMessage::Welcome {
                client_id: PeerId::from(local_id),
            }),
            0,
        );

        Self {
            session,
            socket,
            registry,
            now: 0,
            events,
        }
    }

    /// Move the clock forward and run due work.
    pub fn advance(&mut self, ms: Millis) {
        self.now += ms;
        self.session.tick(self.now);
    }

    /// Deliver one relay frame and process the queue.
    pub fn relay(&mut self, message: RelayMessage) {
        self.session.on_relay_frame(&relay_frame(&message), self.now);
        self.session.tick(self.now);
    }

    pub fn proximity(&mut self, peers: &[&str]) {
        self.relay(RelayMessage::Proximity {
            nearby: peers.iter().map(|p| PeerId::from(*p)).collect(),
        });
    }

    /// Generation of the peer's current link.
    pub fn generation(&self, peer: &str) -> Option<u64> {
        self.session
            .mesh()
            .link(&PeerId::from(peer))
            .map(|l| l.generation)
    }

    /// Complete negotiation of the current link with a memory channel.
    pub fn open_link(&mut self, peer: &str) -> MemoryDataChannel {
        let channel = MemoryDataChannel::new();
        if let Some(generation) = self.generation(peer) {
            self.session.on_link_open(
                &PeerId::from(peer),
                generation,
                Box::new(channel.clone()),
                Some(CandidateType::Host),
                self.now,
            );
        }
        channel
    }

    /// Fail negotiation of the current link, if there is one.
    pub fn fail_link(&mut self, peer: &str) {
        if let Some(generation) = self.generation(peer) {
            self.session
                .on_negotiation_failed(&PeerId::from(peer), generation, self.now);
        }
    }

    /// A peer message arriving on the peer's open link.
    pub fn peer_data(&mut self, peer: &str, message: &PeerMessage) {
        if let Some(generation) = self.generation(peer) {
            self.session
                .on_link_data(&PeerId::from(peer), generation, &peer_frame(message), self.now);
        }
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, kind: SessionEventKind) -> usize {
        self.events.borrow().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }
}

pub fn relay_frame(message: &RelayMessage) -> String {
    encode_frame(message).expect("relay message encodes")
}

pub fn peer_frame(message: &PeerMessage) -> String {
    encode_frame(message).expect("peer message encodes")
}

/// The `type` tag of each frame, in order.
pub fn frame_types(frames: &[String]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| serde_json::from_str::<serde_json::Value>(f).ok())
        .filter_map(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .collect()
}

pub fn identity(username: &str) -> Identity {
    Identity {
        account_id: format!("acct-{username}"),
        username: username.to_string(),
        faction_id: None,
        spawn_time: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_is_connected() {
        let fixture = TestFixture::new("4");
        assert!(fixture.session.relay().is_open());
        assert_eq!(fixture.session.local_id(), &PeerId::from("4"));
        assert_eq!(fixture.count(SessionEventKind::Connected), 1);
        assert_eq!(frame_types(&fixture.socket.sent()), vec!["fingerprint"]);
    }
}
