//! The per-peer state reducer.
//!
//! ## Overview
//!
//! [`StateReconciler`] owns the local participant's own synchronisable state
//! and one [`PeerSyncState`] per remote peer. Inbound messages go through
//! [`StateReconciler::apply`]; local actions go through the `*_local`
//! methods, which return the message to broadcast.
//!
//! An index of which participant holds each shared object is kept alongside
//! the per-peer state so that conflicting claims can be arbitrated when they
//! arrive.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info, trace};

use meshsync_core::{
    CellKey, ClaimKind, ClaimPayload, ClimbPhase, FullStateSnapshot, HarvestActivity, Identity,
    Millis, ObjectId, Occupancy, PeerId, PeerMessage, PeerSyncState, PositionPayload, Spatial,
    Vec3,
};

use crate::effects::{ReconcileEffect, SubState};
use crate::error::{ReconcileError, Result};
use crate::tiebreak::claim_winner;

/// Configuration for the reconciler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Side length of a spatial cell, in world units.
    pub cell_size: f32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { cell_size: 64.0 }
    }
}

/// Reconciles peer messages into per-peer state.
#[derive(Debug)]
pub struct StateReconciler {
    pub(crate) config: ReconcilerConfig,
    pub(crate) local: PeerSyncState,
    pub(crate) peers: HashMap<PeerId, PeerSyncState>,
    /// Which participant holds each shared object, local player included.
    pub(crate) holders: HashMap<ObjectId, PeerId>,
}

impl StateReconciler {
    pub fn new(local_id: PeerId, config: ReconcilerConfig) -> Self {
        Self {
            config,
            local: PeerSyncState::new(local_id),
            peers: HashMap::new(),
            holders: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local.peer_id
    }

    /// The local participant's own state.
    pub fn local(&self) -> &PeerSyncState {
        &self.local
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerSyncState> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerSyncState> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn holder_of(&self, object_id: &ObjectId) -> Option<&PeerId> {
        self.holders.get(object_id)
    }

    /// Adopt the identifier assigned by the relay.
    pub fn set_local_id(&mut self, local_id: PeerId) {
        if local_id == self.local.peer_id {
            return;
        }
        for holder in self.holders.values_mut() {
            if *holder == self.local.peer_id {
                *holder = local_id.clone();
            }
        }
        self.local.peer_id = local_id;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one message received from `from`.
    pub fn apply(&mut self, from: &PeerId, message: PeerMessage) -> Vec<ReconcileEffect> {
        let mut effects = Vec::new();

        if *from == self.local.peer_id {
            trace!(kind = message.kind_name(), "ignoring own echo");
            return effects;
        }
        if matches!(message, PeerMessage::Logout {}) {
            debug!(peer = %from, "peer logged out");
            return self.remove_peer(from);
        }

        let existing = self.peers.remove(from);
        let has_avatar = existing.as_ref().is_some_and(|s| s.has_avatar);
        if !has_avatar && !self.applies_before_avatar(&message) {
            debug!(peer = %from, kind = message.kind_name(), "no avatar, message dropped");
            if let Some(state) = existing {
                self.peers.insert(from.clone(), state);
            }
            return effects;
        }

        let mut state = existing.unwrap_or_else(|| PeerSyncState::new(from.clone()));
        match message {
            PeerMessage::Identity(identity) => {
                self.apply_identity(&mut state, identity, &mut effects)
            }
            PeerMessage::Position(position) => {
                self.apply_position(&mut state, position, &mut effects)
            }
            PeerMessage::FullState(snapshot) => {
                self.apply_snapshot_to(&mut state, snapshot, &mut effects)
            }
            PeerMessage::Claim(claim) => self.apply_claim(&mut state, claim, &mut effects),
            PeerMessage::Release { object_id } => {
                if state.occupancy.as_ref().is_some_and(|o| *o.object_id() == object_id) {
                    self.reconcile_occupancy(&mut state, None, &mut effects);
                }
            }
            PeerMessage::HarvestStart(activity) => {
                self.reconcile_harvest(&mut state, Some(activity), &mut effects)
            }
            PeerMessage::HarvestStop {} => self.reconcile_harvest(&mut state, None, &mut effects),
            PeerMessage::Climb { phase } => {
                self.reconcile_climbing(&mut state, phase, &mut effects)
            }
            PeerMessage::Respawn { spawn_time } => {
                self.apply_respawn(&mut state, spawn_time, &mut effects)
            }
            PeerMessage::EntityBatch(batch) => effects.push(ReconcileEffect::EntityBatchReceived {
                peer_id: from.clone(),
                batch,
            }),
            // Handled before the state lookup.
            PeerMessage::Logout {} => {}
        }
        self.peers.insert(from.clone(), state);
        effects
    }

    /// Whether `message` is applied to a peer whose avatar does not exist yet.
    ///
    /// Beyond the messages that never need an avatar, a claim contesting a
    /// local hold is arbitrated right away, and a respawn is recorded because
    /// elimination reads the spawn time.
    fn applies_before_avatar(&self, message: &PeerMessage) -> bool {
        match message {
            PeerMessage::Claim(claim) => {
                self.holders.get(&claim.object_id) == Some(&self.local.peer_id)
            }
            PeerMessage::Respawn { .. } => true,
            other => other.applies_without_avatar(),
        }
    }

    pub(crate) fn apply_identity(
        &mut self,
        state: &mut PeerSyncState,
        identity: Identity,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        if state.identity.as_ref() == Some(&identity) {
            return;
        }
        if state.has_avatar {
            effects.push(ReconcileEffect::IdentityApplied {
                peer_id: state.peer_id.clone(),
                identity: identity.clone(),
            });
        }
        state.identity = Some(identity);
    }

    pub(crate) fn apply_position(
        &mut self,
        state: &mut PeerSyncState,
        position: PositionPayload,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        if let Some(spatial) = &state.spatial {
            if position.timestamp < spatial.last_update_time {
                trace!(peer = %state.peer_id, "out-of-order position discarded");
                return;
            }
        }

        let cell = CellKey::from_position(position.position, self.config.cell_size);
        let old = state.current_cell();
        state.spatial = Some(Spatial {
            target_position: position.position,
            target_rotation: position.rotation,
            last_update_time: position.timestamp,
            current_cell: Some(cell),
        });
        if old != Some(cell) {
            effects.push(ReconcileEffect::CellChanged {
                peer_id: state.peer_id.clone(),
                old,
                new: cell,
            });
        }

        if state.has_avatar {
            effects.push(ReconcileEffect::MoveTarget {
                peer_id: state.peer_id.clone(),
                position: position.position,
                rotation: position.rotation,
            });
        } else if !state.avatar_requested {
            state.avatar_requested = true;
            effects.push(ReconcileEffect::AvatarRequested {
                peer_id: state.peer_id.clone(),
            });
        }
    }

    fn apply_claim(
        &mut self,
        state: &mut PeerSyncState,
        claim: ClaimPayload,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        if state
            .occupancy
            .as_ref()
            .is_some_and(|o| *o.object_id() == claim.object_id)
        {
            return;
        }
        if !self.may_hold(&state.peer_id, &claim.object_id, effects) {
            debug!(
                peer = %state.peer_id,
                object = %claim.object_id,
                "claim lost to current holder"
            );
            return;
        }
        let next = Occupancy::empty(claim.kind.occupancy_kind(), claim.object_id);
        self.reconcile_occupancy(state, Some(next), effects);
    }

    fn apply_respawn(
        &mut self,
        state: &mut PeerSyncState,
        spawn_time: Millis,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        self.reconcile_occupancy(state, None, effects);
        self.reconcile_harvest(state, None, effects);
        self.reconcile_climbing(state, None, effects);
        if let Some(identity) = state.identity.as_mut() {
            identity.spawn_time = Some(spawn_time);
        }
        effects.push(ReconcileEffect::PeerRespawned {
            peer_id: state.peer_id.clone(),
            spawn_time,
        });
    }

    /// Arbitrate `claimant` taking `object_id`; displaces the current holder
    /// when the claimant wins.
    pub(crate) fn may_hold(
        &mut self,
        claimant: &PeerId,
        object_id: &ObjectId,
        effects: &mut Vec<ReconcileEffect>,
    ) -> bool {
        let holder = match self.holders.get(object_id) {
            None => return true,
            Some(holder) if holder == claimant => return true,
            Some(holder) => holder.clone(),
        };
        if claim_winner(&holder, claimant) != claimant {
            return false;
        }

        self.holders.remove(object_id);
        if holder == self.local.peer_id {
            self.local.occupancy = None;
            info!(object = %object_id, winner = %claimant, "local claim lost, rolled back");
            effects.push(ReconcileEffect::ClaimLost {
                object_id: object_id.clone(),
                winner: claimant.clone(),
            });
        } else if let Some(displaced) = self.peers.get_mut(&holder) {
            if let Some(occupancy) = displaced.occupancy.take() {
                if displaced.has_avatar {
                    effects.push(ReconcileEffect::Teardown {
                        peer_id: holder,
                        sub_state: SubState::Occupancy(occupancy.kind()),
                        object_id: Some(occupancy.object_id().clone()),
                    });
                }
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Avatar lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Mark a peer's avatar as created and replay everything already known.
    pub fn attach_avatar(&mut self, peer_id: &PeerId) -> Vec<ReconcileEffect> {
        let Some(state) = self.peers.get_mut(peer_id) else {
            return Vec::new();
        };
        if state.has_avatar {
            return Vec::new();
        }
        state.has_avatar = true;
        state.avatar_requested = false;

        let mut effects = Vec::new();
        if let Some(identity) = &state.identity {
            effects.push(ReconcileEffect::IdentityApplied {
                peer_id: peer_id.clone(),
                identity: identity.clone(),
            });
        }
        if let Some(spatial) = &state.spatial {
            effects.push(ReconcileEffect::MoveTarget {
                peer_id: peer_id.clone(),
                position: spatial.target_position,
                rotation: spatial.target_rotation,
            });
        }
        if let Some(occupancy) = &state.occupancy {
            effects.push(ReconcileEffect::Construct {
                peer_id: peer_id.clone(),
                sub_state: SubState::Occupancy(occupancy.kind()),
                object_id: Some(occupancy.object_id().clone()),
            });
        }
        if let Some(harvest) = &state.harvest {
            effects.push(ReconcileEffect::Construct {
                peer_id: peer_id.clone(),
                sub_state: SubState::Harvest,
                object_id: Some(harvest.node_id.clone()),
            });
        }
        if state.climbing.is_some() {
            effects.push(ReconcileEffect::Construct {
                peer_id: peer_id.clone(),
                sub_state: SubState::Climbing,
                object_id: None,
            });
        }
        effects
    }

    /// The avatar was destroyed locally; state is kept.
    pub fn detach_avatar(&mut self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(state) if state.has_avatar => {
                state.has_avatar = false;
                state.avatar_requested = false;
                true
            }
            _ => false,
        }
    }

    /// Forget a peer entirely. Calling this twice is a no-op.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Vec<ReconcileEffect> {
        let Some(mut state) = self.peers.remove(peer_id) else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        self.reconcile_occupancy(&mut state, None, &mut effects);
        self.reconcile_harvest(&mut state, None, &mut effects);
        self.reconcile_climbing(&mut state, None, &mut effects);
        if let Some(cell) = state.current_cell() {
            effects.push(ReconcileEffect::RemovedFromCell {
                peer_id: peer_id.clone(),
                cell,
            });
        }
        effects.push(ReconcileEffect::PeerRemoved {
            peer_id: peer_id.clone(),
        });
        effects
    }

    /// Forget every peer, e.g. on logout.
    pub fn clear_peers(&mut self) -> Vec<ReconcileEffect> {
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.iter().flat_map(|id| self.remove_peer(id)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local state
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_local_identity(&mut self, identity: Identity) -> PeerMessage {
        self.local.identity = Some(identity.clone());
        PeerMessage::Identity(identity)
    }

    pub fn set_local_position(
        &mut self,
        position: Vec3,
        rotation: f32,
        now: Millis,
    ) -> PositionPayload {
        self.local.spatial = Some(Spatial {
            target_position: position,
            target_rotation: rotation,
            last_update_time: now,
            current_cell: Some(CellKey::from_position(position, self.config.cell_size)),
        });
        PositionPayload {
            position,
            rotation,
            timestamp: now,
        }
    }

    /// Take exclusive occupancy of a shared object.
    pub fn claim_local(
        &mut self,
        object_id: ObjectId,
        kind: ClaimKind,
        now: Millis,
    ) -> Result<PeerMessage> {
        if let Some(current) = &self.local.occupancy {
            if *current.object_id() != object_id {
                return Err(ReconcileError::AlreadyOccupied(current.object_id().clone()));
            }
        } else if let Some(holder) = self.holders.get(&object_id) {
            return Err(ReconcileError::ObjectHeld {
                object_id,
                holder: holder.clone(),
            });
        }

        self.local.occupancy = Some(Occupancy::empty(kind.occupancy_kind(), object_id.clone()));
        self.holders.insert(object_id.clone(), self.local.peer_id.clone());
        Ok(PeerMessage::Claim(ClaimPayload {
            object_id,
            kind,
            timestamp: now,
        }))
    }

    pub fn release_local(&mut self, object_id: &ObjectId) -> Result<PeerMessage> {
        match &self.local.occupancy {
            Some(current) if current.object_id() == object_id => {
                self.local.occupancy = None;
                self.holders.remove(object_id);
                Ok(PeerMessage::Release {
                    object_id: object_id.clone(),
                })
            }
            _ => Err(ReconcileError::NotOccupying(object_id.clone())),
        }
    }

    pub fn start_local_harvest(&mut self, node_id: ObjectId, now: Millis) -> PeerMessage {
        let activity = HarvestActivity {
            node_id,
            started_at: now,
        };
        self.local.harvest = Some(activity.clone());
        PeerMessage::HarvestStart(activity)
    }

    /// Returns `None` if nothing was being harvested.
    pub fn stop_local_harvest(&mut self) -> Option<PeerMessage> {
        self.local.harvest.take().map(|_| PeerMessage::HarvestStop {})
    }

    pub fn set_local_climbing(&mut self, phase: Option<ClimbPhase>) -> PeerMessage {
        self.local.climbing = phase;
        PeerMessage::Climb { phase }
    }

    /// Reset local state after death. Held objects are released.
    pub fn respawn_local(&mut self, spawn_time: Millis) -> PeerMessage {
        if let Some(occupancy) = self.local.occupancy.take() {
            self.holders.remove(occupancy.object_id());
        }
        self.local.harvest = None;
        self.local.climbing = None;
        if let Some(identity) = self.local.identity.as_mut() {
            identity.spawn_time = Some(spawn_time);
        }
        PeerMessage::Respawn { spawn_time }
    }

    /// Snapshot of the local participant's complete state.
    pub fn build_snapshot(&self, now: Millis) -> FullStateSnapshot {
        FullStateSnapshot {
            identity: self.local.identity.clone(),
            position: self.local.spatial.map(|s| PositionPayload {
                position: s.target_position,
                rotation: s.target_rotation,
                timestamp: s.last_update_time,
            }),
            occupancy: self.local.occupancy.clone(),
            harvest: self.local.harvest.clone(),
            climbing: self.local.climbing,
            taken_at: now,
        }
    }
}
