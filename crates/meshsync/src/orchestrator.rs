//! The session orchestrator.
//!
//! ## Overview
//!
//! [`ConnectionOrchestrator`] owns both transports, the relay message queue,
//! the [`StateReconciler`], the event bus, and its own timers. It decides
//! which peers get links, what happens when a link fails, and what a new link
//! is seeded with.
//!
//! ## Per-peer retry state machine
//!
//! ```text
//!  Idle ──fail──► Retrying(1) ──fail──► ... Retrying(max) ──fail──► Eliminated
//!    ▲                 │                        │
//!    └──── link open ──┴────────────────────────┘   (record cleared)
//! ```
//!
//! A failure while the peer's suppression window is active skips all of this:
//! no retry record, no event.
//!
//! ## Bootstrap order on link open
//!
//! Identity, then position, then a full snapshot, then one entity batch per
//! registered source with something to send.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::Rng;
use tracing::{debug, info, trace, warn};

use meshsync_core::message::limits;
use meshsync_core::{
    ClaimKind, ClientMessage, ClimbPhase, EntityBatch, IceCredentials, Identity, Millis, ObjectId,
    PeerId, PeerMessage, RelayMessage, SignalPayload, TimerId, TimerQueue, Vec3,
};
use meshsync_reconcile::{
    arbitrate_elimination, EliminationVerdict, Participant, ReconcileEffect, StateReconciler,
};
use meshsync_transport::{
    CandidateType, DataChannel, Fingerprint, IceMode, LinkFailure, MeshEvent, MeshStats,
    MessageQueue, MessageSource, NegotiationRequest, PeerMeshTransport, RelayEvent, RelaySocket,
    ReliableChannelTransport,
};

use crate::config::MeshsyncConfig;
use crate::error::{MeshsyncError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::hooks::{EntitySyncSource, WorldRegistry};

/// Identity used until the relay assigns one.
const UNASSIGNED_ID: &str = "unassigned";

/// Work for the negotiation primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationCommand {
    /// Begin negotiating the link described by `request`.
    Start {
        request: NegotiationRequest,
        credentials: Option<IceCredentials>,
    },
    /// A signal from the remote side, relayed to us.
    RemoteSignal {
        peer_id: PeerId,
        generation: u64,
        signal: SignalPayload,
    },
    /// Drop any negotiation in flight for the peer.
    Abandon { peer_id: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionTimer {
    Retry(PeerId),
    SuppressionExpiry(PeerId),
    Rebroadcast,
}

#[derive(Debug, Default)]
struct RetryRecord {
    attempts: u32,
    /// Set while a retry is scheduled.
    timer: Option<TimerId>,
}

#[derive(Debug)]
struct SuppressionWindow {
    expires_at: Millis,
    timer: TimerId,
}

/// Owns every transport and drives retry, elimination, and sync policy.
pub struct ConnectionOrchestrator<S: RelaySocket> {
    config: MeshsyncConfig,
    relay: ReliableChannelTransport<S>,
    relay_url: Option<String>,
    mesh: PeerMeshTransport,
    queue: MessageQueue<RelayMessage>,
    reconciler: StateReconciler,
    bus: EventBus<SessionEvent>,
    registry: Option<Box<dyn WorldRegistry>>,
    entity_sources: Vec<Box<dyn EntitySyncSource>>,
    timers: TimerQueue<SessionTimer>,
    retries: HashMap<PeerId, RetryRecord>,
    suppressions: HashMap<PeerId, SuppressionWindow>,
    /// Peers the relay last reported within proximity.
    nearby: HashSet<PeerId>,
    /// Peers not to relink while they stay nearby.
    eliminated: HashSet<PeerId>,
    awaiting_credentials: Vec<NegotiationRequest>,
    commands: Vec<NegotiationCommand>,
    rebroadcast: Option<TimerId>,
    rebroadcast_jitter_ms: Millis,
    relay_failed: bool,
    logged_out: bool,
}

impl<S: RelaySocket> ConnectionOrchestrator<S> {
    pub fn new(socket: S, fingerprint: Fingerprint, config: MeshsyncConfig) -> Self {
        let jitter = rand::thread_rng().gen_range(0..=config.sync.rebroadcast_jitter_ms);
        Self::with_jitter(socket, fingerprint, config, jitter)
    }

    /// Construct with a fixed rebroadcast jitter instead of a random one.
    pub fn with_jitter(
        socket: S,
        fingerprint: Fingerprint,
        config: MeshsyncConfig,
        rebroadcast_jitter_ms: Millis,
    ) -> Self {
        Self {
            relay: ReliableChannelTransport::new(socket, fingerprint, config.relay.clone()),
            relay_url: None,
            mesh: PeerMeshTransport::new(config.mesh.clone()),
            queue: MessageQueue::new(),
            reconciler: StateReconciler::new(PeerId::from(UNASSIGNED_ID), config.reconciler()),
            bus: EventBus::new(),
            registry: None,
            entity_sources: Vec::new(),
            timers: TimerQueue::new(),
            retries: HashMap::new(),
            suppressions: HashMap::new(),
            nearby: HashSet::new(),
            eliminated: HashSet::new(),
            awaiting_credentials: Vec::new(),
            commands: Vec::new(),
            rebroadcast: None,
            rebroadcast_jitter_ms,
            relay_failed: false,
            logged_out: false,
            config,
        }
    }

    pub fn set_world_registry(&mut self, registry: Box<dyn WorldRegistry>) {
        self.registry = Some(registry);
    }

    pub fn add_entity_source(&mut self, source: Box<dyn EntitySyncSource>) {
        self.entity_sources.push(source);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &MeshsyncConfig {
        &self.config
    }

    pub fn events(&mut self) -> &mut EventBus<SessionEvent> {
        &mut self.bus
    }

    pub fn relay(&self) -> &ReliableChannelTransport<S> {
        &self.relay
    }

    pub fn mesh(&self) -> &PeerMeshTransport {
        &self.mesh
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    pub fn local_id(&self) -> &PeerId {
        self.reconciler.local_id()
    }

    pub fn stats(&self) -> MeshStats {
        self.mesh.stats()
    }

    pub fn selected_candidate(&self, peer_id: &PeerId) -> Option<CandidateType> {
        self.mesh.selected_candidate(peer_id)
    }

    /// Retries spent on the peer's current failure streak.
    pub fn retry_attempts(&self, peer_id: &PeerId) -> u32 {
        self.retries.get(peer_id).map_or(0, |r| r.attempts)
    }

    pub fn has_pending_retry(&self, peer_id: &PeerId) -> bool {
        self.retries
            .get(peer_id)
            .is_some_and(|r| r.timer.is_some())
    }

    pub fn is_suppressed(&self, peer_id: &PeerId, now: Millis) -> bool {
        self.suppressions
            .get(peer_id)
            .is_some_and(|w| now < w.expires_at)
    }

    pub fn is_nearby(&self, peer_id: &PeerId) -> bool {
        self.nearby.contains(peer_id)
    }

    pub fn is_eliminated(&self, peer_id: &PeerId) -> bool {
        self.eliminated.contains(peer_id)
    }

    pub fn rebroadcast_jitter(&self) -> Millis {
        self.rebroadcast_jitter_ms
    }

    pub fn has_queued_messages(&self) -> bool {
        self.queue.has_messages()
    }

    /// Negotiation work produced since the last call.
    pub fn take_commands(&mut self) -> Vec<NegotiationCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Earliest instant `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Millis> {
        [
            self.relay.next_deadline(),
            self.mesh.next_deadline(),
            self.timers.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relay lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn connect(&mut self, url: &str, now: Millis) {
        self.relay_url = Some(url.to_string());
        self.relay_failed = false;
        self.logged_out = false;
        let events = self.relay.connect(url, now);
        self.handle_relay_events(events, now);
    }

    /// Manual reconnect; resets the relay attempt counter.
    pub fn reconnect_now(&mut self, now: Millis) {
        self.relay_failed = false;
        let events = self.relay.reconnect_now(now);
        self.handle_relay_events(events, now);
    }

    pub fn on_relay_open(&mut self, now: Millis) {
        let events = self.relay.on_open(now);
        self.handle_relay_events(events, now);
    }

    pub fn on_relay_frame(&mut self, text: &str, now: Millis) {
        let events = self.relay.on_frame(text, now);
        self.handle_relay_events(events, now);
    }

    pub fn on_relay_close(&mut self, now: Millis) {
        let events = self.relay.on_close(now);
        self.handle_relay_events(events, now);
    }

    /// The host application regained visibility or resumed.
    pub fn on_foreground(&mut self, now: Millis) {
        self.relay.on_foreground(now);
    }

    fn handle_relay_events(&mut self, events: Vec<RelayEvent>, now: Millis) {
        for event in events {
            match event {
                RelayEvent::Connected { client_id } => {
                    self.reconciler.set_local_id(client_id.clone());
                    self.publish(SessionEvent::Connected { client_id });
                }
                RelayEvent::Message(message) => {
                    self.queue.enqueue(message, MessageSource::Relay, now)
                }
                RelayEvent::Disconnected => self.publish(SessionEvent::RelayDisconnected),
                RelayEvent::ReconnectScheduled { attempt, max } => {
                    self.publish(SessionEvent::Reconnecting { attempt, max })
                }
                RelayEvent::Failed => self.on_relay_failed(),
            }
        }
    }

    fn on_relay_failed(&mut self) {
        if self.relay_failed {
            return;
        }
        self.relay_failed = true;
        for (_, record) in self.retries.drain() {
            if let Some(timer) = record.timer {
                self.timers.cancel(timer);
            }
        }
        self.awaiting_credentials.clear();
        warn!("relay connection failed permanently");
        self.publish(SessionEvent::ConnectionFailed);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mesh callbacks
    // ─────────────────────────────────────────────────────────────────────────

    pub fn on_link_open(
        &mut self,
        peer_id: &PeerId,
        generation: u64,
        channel: Box<dyn DataChannel>,
        candidate: Option<CandidateType>,
        now: Millis,
    ) {
        if let Some(event) = self
            .mesh
            .on_channel_open(peer_id, generation, channel, candidate, now)
        {
            self.handle_mesh_event(event, now);
        }
    }

    pub fn on_negotiation_failed(&mut self, peer_id: &PeerId, generation: u64, now: Millis) {
        if let Some(event) = self.mesh.on_negotiation_failed(peer_id, generation) {
            self.handle_mesh_event(event, now);
        }
    }

    pub fn on_link_disconnected(&mut self, peer_id: &PeerId, generation: u64, now: Millis) {
        if let Some(event) = self.mesh.on_disconnected(peer_id, generation) {
            self.handle_mesh_event(event, now);
        }
    }

    pub fn on_link_error(&mut self, peer_id: &PeerId, generation: u64, now: Millis) {
        if let Some(event) = self.mesh.on_channel_error(peer_id, generation) {
            self.handle_mesh_event(event, now);
        }
    }

    pub fn on_link_data(&mut self, peer_id: &PeerId, generation: u64, text: &str, now: Millis) {
        if let Some(event) = self.mesh.on_data(peer_id, generation, text) {
            self.handle_mesh_event(event, now);
        }
    }

    /// Relay an outbound negotiation signal. Stale generations are dropped.
    pub fn send_signal(
        &mut self,
        peer_id: &PeerId,
        generation: u64,
        signal: SignalPayload,
    ) -> bool {
        if !self.mesh.is_current(peer_id, generation) {
            trace!(peer = %peer_id, generation, "dropping signal for stale link");
            return false;
        }
        self.relay.send(&ClientMessage::Signal {
            to: peer_id.clone(),
            signal,
        })
    }

    fn handle_mesh_events(&mut self, events: Vec<MeshEvent>, now: Millis) {
        for event in events {
            self.handle_mesh_event(event, now);
        }
    }

    fn handle_mesh_event(&mut self, event: MeshEvent, now: Millis) {
        match event {
            MeshEvent::LinkOpened {
                peer_id,
                role,
                candidate,
            } => {
                info!(peer = %peer_id, ?role, ?candidate, "peer link open");
                self.clear_retry(&peer_id);
                self.awaiting_credentials.retain(|r| r.peer_id != peer_id);
                self.publish(SessionEvent::PeerConnected {
                    peer_id: peer_id.clone(),
                    candidate,
                });
                self.bootstrap(&peer_id, now);
                self.ensure_rebroadcast(now);
            }
            MeshEvent::LinkFailed { peer_id, reason } => {
                self.on_link_failure(&peer_id, reason, now)
            }
            MeshEvent::LinkClosed { peer_id } => {
                self.commands.push(NegotiationCommand::Abandon { peer_id })
            }
            MeshEvent::Message { peer_id, message } => {
                self.apply_peer_message(&peer_id, message, now)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Run due timers and drain one batch of relay messages.
    pub fn tick(&mut self, now: Millis) {
        let events = self.relay.tick(now);
        self.handle_relay_events(events, now);
        let events = self.mesh.tick(now);
        self.handle_mesh_events(events, now);

        for (_, timer) in self.timers.pop_expired(now) {
            match timer {
                SessionTimer::Retry(peer_id) => self.on_retry_due(&peer_id, now),
                SessionTimer::SuppressionExpiry(peer_id) => {
                    self.on_suppression_expired(&peer_id, now)
                }
                SessionTimer::Rebroadcast => self.on_rebroadcast_due(now),
            }
        }

        self.process_queue(now);
    }

    /// Handle at most `drain_batch` queued relay messages.
    pub fn process_queue(&mut self, now: Millis) -> usize {
        let batch: Vec<_> = self.queue.drain(self.config.sync.drain_batch).collect();
        let handled = batch.len();
        for queued in batch {
            self.handle_relay_message(queued.payload, now);
        }
        handled
    }

    fn handle_relay_message(&mut self, message: RelayMessage, now: Millis) {
        match message {
            RelayMessage::Proximity { nearby } => self.update_proximity(nearby, now),
            RelayMessage::Signal { from, signal } => self.on_remote_signal(from, signal, now),
            RelayMessage::IceCredentials(credentials) => self.on_ice_credentials(credentials),
            RelayMessage::PlayerDied { peer_id } => {
                if peer_id == *self.local_id() {
                    return;
                }
                let window = self.config.sync.suppression_window_ms;
                self.suppress_peer(&peer_id, window, now);
                self.publish(SessionEvent::PeerDied { peer_id });
            }
            RelayMessage::PeerLeft { peer_id } => self.remove_peer(&peer_id),
            RelayMessage::Forward { from, message } => self.apply_peer_message(&from, message, now),
            RelayMessage::Welcome { .. }
            | RelayMessage::Rejected { .. }
            | RelayMessage::Pong {} => {
                debug!("ignoring relay control frame in queue")
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Links
    // ─────────────────────────────────────────────────────────────────────────

    fn update_proximity(&mut self, nearby: Vec<PeerId>, now: Millis) {
        let local = self.local_id().clone();
        let next: HashSet<PeerId> = nearby.into_iter().filter(|p| *p != local).collect();
        let departed: Vec<PeerId> = self.nearby.difference(&next).cloned().collect();
        let arrived: Vec<PeerId> = next.difference(&self.nearby).cloned().collect();

        for peer_id in &departed {
            debug!(peer = %peer_id, "peer left proximity");
            self.remove_peer(peer_id);
        }
        self.eliminated.retain(|p| next.contains(p));
        self.nearby = next;

        if self.relay_failed || self.logged_out {
            return;
        }
        for peer_id in arrived {
            if !self.eliminated.contains(&peer_id) {
                self.start_link(&peer_id, false, now);
            }
        }
    }

    /// Create a link; the lower identity initiates.
    fn start_link(&mut self, peer_id: &PeerId, use_relay: bool, now: Millis) {
        let initiator = self.local_id().cmp_identity(peer_id) == Ordering::Less;
        let request = self.mesh.create_link(peer_id, initiator, use_relay, now);
        self.awaiting_credentials.retain(|r| r.peer_id != *peer_id);

        if request.ice_mode == IceMode::Relay {
            if self.relay.send(&ClientMessage::RequestIceCredentials {}) {
                self.awaiting_credentials.push(request);
                return;
            }
            debug!(peer = %peer_id, "relay unavailable, negotiating without relay credentials");
        }
        self.commands.push(NegotiationCommand::Start {
            request,
            credentials: None,
        });
    }

    fn on_ice_credentials(&mut self, credentials: IceCredentials) {
        for request in std::mem::take(&mut self.awaiting_credentials) {
            if self.mesh.is_current(&request.peer_id, request.generation) {
                self.commands.push(NegotiationCommand::Start {
                    request,
                    credentials: Some(credentials.clone()),
                });
            }
        }
    }

    fn on_remote_signal(&mut self, from: PeerId, signal: SignalPayload, now: Millis) {
        if from == *self.local_id() {
            return;
        }
        if !self.mesh.has_link(&from) {
            // The offer raced ahead of the proximity update.
            if self.eliminated.contains(&from) || self.relay_failed || self.logged_out {
                return;
            }
            self.nearby.insert(from.clone());
            self.start_link(&from, false, now);
            // The remote side retried first; answer it instead of our own retry.
            if let Some(timer) = self.retries.get_mut(&from).and_then(|r| r.timer.take()) {
                self.timers.cancel(timer);
            }
        }
        if let Some(link) = self.mesh.link(&from) {
            self.commands.push(NegotiationCommand::RemoteSignal {
                peer_id: from,
                generation: link.generation,
                signal,
            });
        }
    }

    fn on_link_failure(&mut self, peer_id: &PeerId, reason: LinkFailure, now: Millis) {
        self.commands.push(NegotiationCommand::Abandon {
            peer_id: peer_id.clone(),
        });
        self.awaiting_credentials.retain(|r| r.peer_id != *peer_id);

        if self.is_suppressed(peer_id, now) {
            debug!(peer = %peer_id, ?reason, "link failure suppressed");
            return;
        }
        if self.relay_failed || self.logged_out || !self.nearby.contains(peer_id) {
            return;
        }

        let max = self.config.retry.max_retries;
        if self.retry_attempts(peer_id) >= max {
            warn!(peer = %peer_id, ?reason, "link failed, retries exhausted");
            self.eliminate(peer_id);
            return;
        }

        let deadline = now + self.config.retry.retry_delay_ms;
        let record = self.retries.entry(peer_id.clone()).or_default();
        if let Some(pending) = record.timer.take() {
            self.timers.cancel(pending);
        }
        record.attempts += 1;
        record.timer = Some(
            self.timers
                .schedule(deadline, SessionTimer::Retry(peer_id.clone())),
        );
        let attempt = record.attempts;

        warn!(peer = %peer_id, ?reason, attempt, max, "link failed, retry scheduled");
        self.publish(SessionEvent::PeerRetrying {
            peer_id: peer_id.clone(),
            attempt,
            max,
        });
    }

    fn on_retry_due(&mut self, peer_id: &PeerId, now: Millis) {
        let Some(record) = self.retries.get_mut(peer_id) else {
            return;
        };
        record.timer = None;
        let attempt = record.attempts;

        if self.relay_failed
            || !self.nearby.contains(peer_id)
            || self.eliminated.contains(peer_id)
        {
            self.retries.remove(peer_id);
            return;
        }
        if self.mesh.has_link(peer_id) {
            debug!(peer = %peer_id, attempt, "link already renegotiating, retry skipped");
            return;
        }
        debug!(peer = %peer_id, attempt, "retrying link");
        // Retried initiators fall back to relay candidates.
        self.start_link(peer_id, true, now);
    }

    /// Retries are exhausted: decide which side gives up.
    fn eliminate(&mut self, peer_id: &PeerId) {
        self.clear_retry(peer_id);
        self.eliminated.insert(peer_id.clone());

        let local = Participant {
            peer_id: self.local_id().clone(),
            spawn_time: self.reconciler.local().spawn_time(),
        };
        let remote = Participant {
            peer_id: peer_id.clone(),
            spawn_time: self.reconciler.peer(peer_id).and_then(|s| s.spawn_time()),
        };

        match arbitrate_elimination(&local, &remote) {
            EliminationVerdict::RemoteLoses => {
                info!(peer = %peer_id, "peer eliminated");
                self.remove_peer(peer_id);
                self.publish(SessionEvent::PeerEliminated {
                    peer_id: peer_id.clone(),
                });
            }
            EliminationVerdict::LocalLoses => {
                info!(peer = %peer_id, "local side lost elimination arbitration");
                if self.mesh.close_link(peer_id).is_some() {
                    self.commands.push(NegotiationCommand::Abandon {
                        peer_id: peer_id.clone(),
                    });
                }
                self.publish(SessionEvent::EliminatedSelf {
                    conflicting_peer: peer_id.clone(),
                });
            }
        }
    }

    fn clear_retry(&mut self, peer_id: &PeerId) {
        if let Some(record) = self.retries.remove(peer_id) {
            if let Some(timer) = record.timer {
                self.timers.cancel(timer);
            }
        }
    }

    /// Swallow failures from `peer_id` for `duration_ms`. Extends, never
    /// shortens, an active window.
    pub fn suppress_peer(&mut self, peer_id: &PeerId, duration_ms: Millis, now: Millis) {
        let expires_at = now + duration_ms;
        if let Some(existing) = self.suppressions.get(peer_id) {
            if existing.expires_at >= expires_at {
                return;
            }
            self.timers.cancel(existing.timer);
        }
        let timer = self
            .timers
            .schedule(expires_at, SessionTimer::SuppressionExpiry(peer_id.clone()));
        self.suppressions.insert(
            peer_id.clone(),
            SuppressionWindow { expires_at, timer },
        );
        self.clear_retry(peer_id);
        debug!(peer = %peer_id, expires_at, "failures suppressed");
    }

    fn on_suppression_expired(&mut self, peer_id: &PeerId, now: Millis) {
        if !self
            .suppressions
            .get(peer_id)
            .is_some_and(|w| w.expires_at <= now)
        {
            return;
        }
        self.suppressions.remove(peer_id);
        debug!(peer = %peer_id, "suppression window expired");

        let relink = self.nearby.contains(peer_id)
            && !self.mesh.has_link(peer_id)
            && !self.eliminated.contains(peer_id)
            && !self.relay_failed
            && !self.logged_out;
        if relink {
            self.start_link(peer_id, false, now);
        }
    }

    /// Forget a peer: link, timers, and reconciled state. Idempotent.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.clear_retry(peer_id);
        if let Some(window) = self.suppressions.remove(peer_id) {
            self.timers.cancel(window.timer);
        }
        self.awaiting_credentials.retain(|r| r.peer_id != *peer_id);
        if self.mesh.close_link(peer_id).is_some() {
            self.commands.push(NegotiationCommand::Abandon {
                peer_id: peer_id.clone(),
            });
        }
        self.nearby.remove(peer_id);
        let effects = self.reconciler.remove_peer(peer_id);
        self.handle_effects(effects);
    }

    /// The renderer created the peer's avatar; replays stored state.
    pub fn attach_avatar(&mut self, peer_id: &PeerId) {
        let effects = self.reconciler.attach_avatar(peer_id);
        self.handle_effects(effects);
    }

    /// The renderer dropped the peer's avatar.
    pub fn detach_avatar(&mut self, peer_id: &PeerId) -> bool {
        self.reconciler.detach_avatar(peer_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    fn bootstrap(&mut self, peer_id: &PeerId, now: Millis) {
        let snapshot = self.reconciler.build_snapshot(now);
        let mut frames = Vec::new();
        if let Some(identity) = snapshot.identity.clone() {
            frames.push(PeerMessage::Identity(identity));
        }
        if let Some(position) = snapshot.position {
            frames.push(PeerMessage::Position(position));
        }
        frames.push(PeerMessage::FullState(snapshot));
        for source in &self.entity_sources {
            let entities = source.active_for_sync();
            for chunk in entities.chunks(limits::MAX_ENTITIES_PER_BATCH) {
                frames.push(PeerMessage::EntityBatch(EntityBatch {
                    kind: source.kind().to_string(),
                    entities: chunk.to_vec(),
                }));
            }
        }

        for frame in &frames {
            if !self.mesh.send_to(peer_id, frame) {
                debug!(peer = %peer_id, "bootstrap interrupted");
                return;
            }
        }
        debug!(peer = %peer_id, frames = frames.len(), "bootstrap sent");
    }

    fn ensure_rebroadcast(&mut self, now: Millis) {
        if self.rebroadcast.is_some_and(|t| self.timers.is_armed(t)) {
            return;
        }
        let period = self.config.sync.rebroadcast_interval_ms + self.rebroadcast_jitter_ms;
        self.rebroadcast = Some(self.timers.schedule(now + period, SessionTimer::Rebroadcast));
    }

    fn on_rebroadcast_due(&mut self, now: Millis) {
        self.rebroadcast = None;
        if !self.mesh.has_open_links() {
            debug!("no open links, rebroadcast paused");
            return;
        }
        let snapshot = self.reconciler.build_snapshot(now);
        let sent = self.mesh.broadcast(&PeerMessage::FullState(snapshot));
        trace!(sent, "full state rebroadcast");
        self.ensure_rebroadcast(now);
    }

    fn apply_peer_message(&mut self, from: &PeerId, message: PeerMessage, now: Millis) {
        if matches!(message, PeerMessage::Respawn { .. }) && from != self.local_id() {
            let window = self.config.sync.suppression_window_ms;
            self.suppress_peer(from, window, now);
        }
        let effects = self.reconciler.apply(from, message);
        self.handle_effects(effects);
    }

    fn handle_effects(&mut self, effects: Vec<ReconcileEffect>) {
        for effect in effects {
            if let Some(registry) = self.registry.as_mut() {
                match &effect {
                    ReconcileEffect::CellChanged { peer_id, old, new } => {
                        registry.update_player_cell(peer_id, *old, *new)
                    }
                    ReconcileEffect::RemovedFromCell { peer_id, cell } => {
                        registry.remove_from_registry(peer_id, *cell)
                    }
                    _ => {}
                }
            }
            self.publish(SessionEvent::State(effect));
        }
    }

    /// Send to every open link; peers nearby without one get it through the
    /// relay instead.
    fn broadcast(&mut self, message: PeerMessage) -> usize {
        let sent = self.mesh.broadcast(&message);
        let unreachable = self
            .nearby
            .iter()
            .any(|p| !self.mesh.link(p).is_some_and(|l| l.is_open()));
        if unreachable && self.relay.send(&ClientMessage::Forward { message }) {
            trace!("peer message forwarded through relay");
        }
        sent
    }

    fn publish(&mut self, event: SessionEvent) {
        self.bus.publish(&event);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local actions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_local_identity(&mut self, identity: Identity) {
        let message = self.reconciler.set_local_identity(identity);
        self.broadcast(message);
    }

    pub fn set_local_position(&mut self, position: Vec3, rotation: f32, now: Millis) {
        let old = self.reconciler.local().current_cell();
        let payload = self.reconciler.set_local_position(position, rotation, now);
        let new = self.reconciler.local().current_cell();
        if let (Some(new), Some(registry)) = (new, self.registry.as_mut()) {
            if old != Some(new) {
                registry.update_player_cell(self.reconciler.local_id(), old, new);
            }
        }
        // Positions are too frequent for the relay fallback.
        self.mesh.broadcast(&PeerMessage::Position(payload));
    }

    pub fn claim_object(
        &mut self,
        object_id: ObjectId,
        kind: ClaimKind,
        now: Millis,
    ) -> Result<()> {
        let message = self.reconciler.claim_local(object_id, kind, now)?;
        self.broadcast(message);
        Ok(())
    }

    pub fn release_object(&mut self, object_id: &ObjectId) -> Result<()> {
        let message = self.reconciler.release_local(object_id)?;
        self.broadcast(message);
        Ok(())
    }

    pub fn start_harvest(&mut self, node_id: ObjectId, now: Millis) {
        let message = self.reconciler.start_local_harvest(node_id, now);
        self.broadcast(message);
    }

    pub fn stop_harvest(&mut self) {
        if let Some(message) = self.reconciler.stop_local_harvest() {
            self.broadcast(message);
        }
    }

    pub fn set_climbing(&mut self, phase: Option<ClimbPhase>) {
        let message = self.reconciler.set_local_climbing(phase);
        self.broadcast(message);
    }

    /// Start a controlled teardown for respawn.
    ///
    /// Peers are told first, then every link and the relay are closed on
    /// purpose. Failures from current peers are suppressed for the configured
    /// window. Call [`finish_respawn`](Self::finish_respawn) to come back.
    pub fn begin_respawn(&mut self, spawn_time: Millis, now: Millis) {
        let message = self.reconciler.respawn_local(spawn_time);
        self.broadcast(message);

        let window = self.config.sync.suppression_window_ms;
        let peers: Vec<PeerId> = self.nearby.iter().cloned().collect();
        for peer_id in &peers {
            self.suppress_peer(peer_id, window, now);
        }
        for event in self.mesh.close_all() {
            if let MeshEvent::LinkClosed { peer_id } = event {
                self.commands.push(NegotiationCommand::Abandon { peer_id });
            }
        }
        self.awaiting_credentials.clear();
        self.nearby.clear();
        self.eliminated.clear();
        self.relay.disconnect(true, now);

        info!(spawn_time, "respawn started");
        self.publish(SessionEvent::Respawning { spawn_time });
    }

    /// Reconnect to the relay after [`begin_respawn`](Self::begin_respawn).
    pub fn finish_respawn(&mut self, now: Millis) -> Result<()> {
        let url = self.relay_url.clone().ok_or(MeshsyncError::NotConnected)?;
        self.connect(&url, now);
        Ok(())
    }

    /// Leave the world. Calling this twice is a no-op.
    pub fn logout(&mut self, now: Millis) {
        if self.logged_out {
            return;
        }
        self.broadcast(PeerMessage::Logout {});
        self.logged_out = true;

        for event in self.mesh.close_all() {
            if let MeshEvent::LinkClosed { peer_id } = event {
                self.commands.push(NegotiationCommand::Abandon { peer_id });
            }
        }
        self.relay.disconnect(true, now);

        self.timers.clear();
        self.retries.clear();
        self.suppressions.clear();
        self.awaiting_credentials.clear();
        self.nearby.clear();
        self.eliminated.clear();
        self.rebroadcast = None;
        self.queue.clear();

        let effects = self.reconciler.clear_peers();
        self.handle_effects(effects);
        info!("logged out");
        self.publish(SessionEvent::LoggedOut);
    }
}
