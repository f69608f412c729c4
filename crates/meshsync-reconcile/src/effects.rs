//! Side effects requested by the reconciler.

use meshsync_core::{
    CellKey, EntityBatch, Identity, Millis, ObjectId, OccupancyKind, PeerId, Vec3,
};

/// A sub-state of a peer that has its own local representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubState {
    Occupancy(OccupancyKind),
    Harvest,
    Climbing,
}

/// Something a collaborator should do in response to reconciled state.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEffect {
    /// A peer has positional state but no avatar; create one and call
    /// `attach_avatar`.
    AvatarRequested { peer_id: PeerId },

    /// Apply visual identity (name plate, faction colour).
    IdentityApplied { peer_id: PeerId, identity: Identity },

    MoveTarget {
        peer_id: PeerId,
        position: Vec3,
        rotation: f32,
    },

    /// Build the local representation of a sub-state.
    Construct {
        peer_id: PeerId,
        sub_state: SubState,
        object_id: Option<ObjectId>,
    },

    /// Remove the local representation of a sub-state.
    Teardown {
        peer_id: PeerId,
        sub_state: SubState,
        object_id: Option<ObjectId>,
    },

    /// Representation exists on both sides; refresh its targets only.
    UpdateTargets { peer_id: PeerId, sub_state: SubState },

    /// The peer moved between spatial cells.
    CellChanged {
        peer_id: PeerId,
        old: Option<CellKey>,
        new: CellKey,
    },

    /// The peer left the spatial registry.
    RemovedFromCell { peer_id: PeerId, cell: CellKey },

    /// The local player lost a contested claim and was rolled back.
    ClaimLost { object_id: ObjectId, winner: PeerId },

    PeerRespawned { peer_id: PeerId, spawn_time: Millis },

    EntityBatchReceived { peer_id: PeerId, batch: EntityBatch },

    /// All state for the peer is gone.
    PeerRemoved { peer_id: PeerId },
}

impl ReconcileEffect {
    /// Whether this effect creates or destroys a local representation.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ReconcileEffect::Construct { .. } | ReconcileEffect::Teardown { .. }
        )
    }
}
