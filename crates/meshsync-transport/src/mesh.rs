//! Direct peer-to-peer links.
//!
//! One [`PeerLink`] per peer, at most. Creating a link bumps a generation
//! counter; every negotiation callback carries the generation it was issued
//! for, and anything addressed to an older generation (or to a link the local
//! side is closing on purpose) is ignored. This is how abandoned negotiations
//! are tolerated: their results simply no longer match.
//!
//! Negotiation tiers:
//!
//! | role      | attempt  | candidates           |
//! |-----------|----------|----------------------|
//! | initiator | first    | direct only          |
//! | initiator | retried  | direct + relay (TURN)|
//! | responder | any      | direct + relay (TURN)|

use std::collections::HashMap;
use std::fmt;

use meshsync_core::{decode_frame, encode_frame, Millis, PeerId, PeerMessage, TimerQueue};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::socket::DataChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Which candidates a negotiation may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceMode {
    /// Host and server-reflexive candidates only.
    Direct,
    /// Relay credentials fetched on demand, in addition to direct candidates.
    Relay,
}

/// Type of the candidate pair the connection settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateType {
    pub fn is_relayed(self) -> bool {
        self == CandidateType::Relayed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailure {
    NegotiationFailed,
    Disconnected,
    HandshakeTimeout,
    ChannelError,
}

/// What the negotiation primitive should do for a freshly created link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRequest {
    pub peer_id: PeerId,
    pub generation: u64,
    pub role: LinkRole,
    pub ice_mode: IceMode,
}

/// Notifications produced by the mesh transport.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    LinkOpened {
        peer_id: PeerId,
        role: LinkRole,
        candidate: Option<CandidateType>,
    },
    LinkFailed {
        peer_id: PeerId,
        reason: LinkFailure,
    },
    /// Closed on purpose by the local side. Not a failure.
    LinkClosed { peer_id: PeerId },
    Message {
        peer_id: PeerId,
        message: PeerMessage,
    },
}

/// One connection attempt to one peer.
pub struct PeerLink {
    pub peer_id: PeerId,
    pub role: LinkRole,
    pub state: LinkState,
    pub ice_mode: IceMode,
    pub generation: u64,
    pub created_at: Millis,
    pub opened_at: Option<Millis>,
    pub selected_candidate: Option<CandidateType>,
    intentional_close: bool,
    channel: Option<Box<dyn DataChannel>>,
}

impl PeerLink {
    pub fn has_data_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    fn shutdown(&mut self, state: LinkState) {
        self.state = state;
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("ice_mode", &self.ice_mode)
            .field("generation", &self.generation)
            .field("has_data_channel", &self.has_data_channel())
            .finish()
    }
}

/// Counts for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub connecting: usize,
    pub open: usize,
    pub direct: usize,
    pub relayed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HandshakeDeadline {
    peer_id: PeerId,
    generation: u64,
}

/// Owner of every peer link.
pub struct PeerMeshTransport {
    config: MeshConfig,
    links: HashMap<PeerId, PeerLink>,
    next_generation: u64,
    timers: TimerQueue<HandshakeDeadline>,
}

impl PeerMeshTransport {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            links: HashMap::new(),
            next_generation: 1,
            timers: TimerQueue::new(),
        }
    }

    pub fn link(&self, peer_id: &PeerId) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn has_link(&self, peer_id: &PeerId) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Whether `generation` is still the live attempt for `peer_id`.
    pub fn is_current(&self, peer_id: &PeerId, generation: u64) -> bool {
        self.links
            .get(peer_id)
            .is_some_and(|l| l.generation == generation && !l.intentional_close)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.links
            .values()
            .filter(|l| l.is_open())
            .map(|l| l.peer_id.clone())
            .collect()
    }

    pub fn has_open_links(&self) -> bool {
        self.links.values().any(PeerLink::is_open)
    }

    /// Candidate type the link settled on, once open.
    pub fn selected_candidate(&self, peer_id: &PeerId) -> Option<CandidateType> {
        self.links.get(peer_id).and_then(|l| l.selected_candidate)
    }

    pub fn stats(&self) -> MeshStats {
        let mut stats = MeshStats::default();
        for link in self.links.values() {
            match link.state {
                LinkState::Connecting => stats.connecting += 1,
                LinkState::Open => {
                    stats.open += 1;
                    match link.selected_candidate {
                        Some(c) if c.is_relayed() => stats.relayed += 1,
                        Some(_) => stats.direct += 1,
                        None => {}
                    }
                }
                LinkState::Closed | LinkState::Failed => {}
            }
        }
        stats
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Link lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the link to `peer_id`, tearing down any previous one first.
    pub fn create_link(
        &mut self,
        peer_id: &PeerId,
        is_initiator: bool,
        use_relay: bool,
        now: Millis,
    ) -> NegotiationRequest {
        if let Some(mut previous) = self.links.remove(peer_id) {
            debug!(peer = %peer_id, generation = previous.generation, "replacing link");
            previous.intentional_close = true;
            previous.shutdown(LinkState::Closed);
        }
        self.cancel_handshake(peer_id);

        let generation = self.next_generation;
        self.next_generation += 1;

        let role = if is_initiator {
            LinkRole::Initiator
        } else {
            LinkRole::Responder
        };
        let ice_mode = match role {
            LinkRole::Initiator if !use_relay => IceMode::Direct,
            _ => IceMode::Relay,
        };

        self.links.insert(
            peer_id.clone(),
            PeerLink {
                peer_id: peer_id.clone(),
                role,
                state: LinkState::Connecting,
                ice_mode,
                generation,
                created_at: now,
                opened_at: None,
                selected_candidate: None,
                intentional_close: false,
                channel: None,
            },
        );
        self.timers.schedule(
            now + self.config.handshake_timeout_ms,
            HandshakeDeadline {
                peer_id: peer_id.clone(),
                generation,
            },
        );
        debug!(peer = %peer_id, generation, ?role, ?ice_mode, "link created");

        NegotiationRequest {
            peer_id: peer_id.clone(),
            generation,
            role,
            ice_mode,
        }
    }

    /// Close a link on purpose (out of proximity, logout). Idempotent.
    pub fn close_link(&mut self, peer_id: &PeerId) -> Option<MeshEvent> {
        self.cancel_handshake(peer_id);
        let mut link = self.links.remove(peer_id)?;
        link.intentional_close = true;
        link.shutdown(LinkState::Closed);
        debug!(peer = %peer_id, "link closed intentionally");
        Some(MeshEvent::LinkClosed {
            peer_id: peer_id.clone(),
        })
    }

    /// Close every link on purpose.
    pub fn close_all(&mut self) -> Vec<MeshEvent> {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers.iter().filter_map(|p| self.close_link(p)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Negotiation callbacks
    // ─────────────────────────────────────────────────────────────────────────

    /// The data channel for `generation` is ready.
    ///
    /// A channel arriving for a stale or closing link is closed immediately.
    pub fn on_channel_open(
        &mut self,
        peer_id: &PeerId,
        generation: u64,
        mut channel: Box<dyn DataChannel>,
        candidate: Option<CandidateType>,
        now: Millis,
    ) -> Option<MeshEvent> {
        let link = match self.links.get_mut(peer_id) {
            Some(link)
                if link.generation == generation
                    && !link.intentional_close
                    && link.state == LinkState::Connecting =>
            {
                link
            }
            _ => {
                debug!(peer = %peer_id, generation, "discarding channel for stale link");
                channel.close();
                return None;
            }
        };

        link.state = LinkState::Open;
        link.channel = Some(channel);
        link.opened_at = Some(now);
        link.selected_candidate = candidate;
        let role = link.role;
        self.cancel_handshake(peer_id);

        info!(peer = %peer_id, ?candidate, "link open");
        Some(MeshEvent::LinkOpened {
            peer_id: peer_id.clone(),
            role,
            candidate,
        })
    }

    pub fn on_negotiation_failed(
        &mut self,
        peer_id: &PeerId,
        generation: u64,
    ) -> Option<MeshEvent> {
        self.fail_link(peer_id, generation, LinkFailure::NegotiationFailed)
    }

    pub fn on_disconnected(&mut self, peer_id: &PeerId, generation: u64) -> Option<MeshEvent> {
        self.fail_link(peer_id, generation, LinkFailure::Disconnected)
    }

    pub fn on_channel_error(&mut self, peer_id: &PeerId, generation: u64) -> Option<MeshEvent> {
        self.fail_link(peer_id, generation, LinkFailure::ChannelError)
    }

    /// A text frame arrived on the data channel.
    pub fn on_data(&mut self, peer_id: &PeerId, generation: u64, text: &str) -> Option<MeshEvent> {
        let link = self.links.get(peer_id)?;
        if link.generation != generation || link.intentional_close || !link.is_open() {
            return None;
        }
        let message: PeerMessage = match decode_frame(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer_id, "dropping peer frame: {}", e);
                return None;
            }
        };
        if let Err(reason) = message.validate_limits() {
            warn!(peer = %peer_id, "dropping peer frame: {}", reason);
            return None;
        }
        Some(MeshEvent::Message {
            peer_id: peer_id.clone(),
            message,
        })
    }

    /// Run due handshake deadlines.
    pub fn tick(&mut self, now: Millis) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        for (_, deadline) in self.timers.pop_expired(now) {
            let still_connecting = self.links.get(&deadline.peer_id).is_some_and(|l| {
                l.generation == deadline.generation && l.state == LinkState::Connecting
            });
            if still_connecting {
                warn!(peer = %deadline.peer_id, "handshake timed out");
                events.extend(self.fail_link(
                    &deadline.peer_id,
                    deadline.generation,
                    LinkFailure::HandshakeTimeout,
                ));
            }
        }
        events
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────────

    /// Send to one peer. Returns whether the frame was written.
    pub fn send_to(&mut self, peer_id: &PeerId, message: &PeerMessage) -> bool {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode peer frame: {}", e);
                return false;
            }
        };
        self.write(peer_id, &frame)
    }

    /// Serialise once and write to every open link. Returns the number of
    /// peers the frame was written to.
    pub fn broadcast(&mut self, message: &PeerMessage) -> usize {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode broadcast frame: {}", e);
                return 0;
            }
        };
        let mut recipients = 0;
        for link in self.links.values_mut() {
            if !link.is_open() {
                continue;
            }
            if let Some(channel) = link.channel.as_mut() {
                match channel.send_text(&frame) {
                    Ok(()) => recipients += 1,
                    Err(e) => debug!(peer = %link.peer_id, "broadcast write failed: {}", e),
                }
            }
        }
        recipients
    }

    fn write(&mut self, peer_id: &PeerId, frame: &str) -> bool {
        let Some(link) = self.links.get_mut(peer_id) else {
            return false;
        };
        if !link.is_open() {
            return false;
        }
        match link.channel.as_mut().map(|c| c.send_text(frame)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                debug!(peer = %peer_id, "peer write failed: {}", e);
                false
            }
            None => false,
        }
    }

    fn fail_link(
        &mut self,
        peer_id: &PeerId,
        generation: u64,
        reason: LinkFailure,
    ) -> Option<MeshEvent> {
        let link = self.links.get(peer_id)?;
        if link.generation != generation || link.intentional_close {
            debug!(peer = %peer_id, generation, ?reason, "ignoring failure for stale link");
            return None;
        }
        let mut link = self.links.remove(peer_id)?;
        link.shutdown(LinkState::Failed);
        self.cancel_handshake(peer_id);
        warn!(peer = %peer_id, ?reason, "link failed");
        Some(MeshEvent::LinkFailed {
            peer_id: peer_id.clone(),
            reason,
        })
    }

    fn cancel_handshake(&mut self, peer_id: &PeerId) {
        self.timers.cancel_where(|d| &d.peer_id == peer_id);
    }
}
