//! Per-peer synchronisable state.
//!
//! [`PeerSyncState`] is the local belief about one remote participant. It is
//! created on the first message from that peer and dropped on logout or
//! elimination. The reconciler is the only writer.

use serde::{Deserialize, Serialize};

use crate::types::{CellKey, Millis, ObjectId, PeerId, Vec3};

/// Visual and account identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub account_id: String,
    pub username: String,
    pub faction_id: Option<String>,
    /// Authoritative spawn timestamp, used by elimination arbitration.
    pub spawn_time: Option<Millis>,
}

/// Where the peer is heading, as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spatial {
    pub target_position: Vec3,
    pub target_rotation: f32,
    pub last_update_time: Millis,
    pub current_cell: Option<CellKey>,
}

/// One item carried in a towed cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoItem {
    pub item_id: String,
    pub quantity: u32,
}

/// Exclusive occupancy of a shared object.
///
/// A participant holds at most one of these at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Occupancy {
    Piloting {
        vehicle_id: ObjectId,
        /// Passengers aboard, excluding the pilot.
        #[serde(default)]
        crew: Vec<PeerId>,
    },
    TowingCart {
        cart_id: ObjectId,
        #[serde(default)]
        cargo: Vec<CargoItem>,
    },
    TowingArtillery {
        artillery_id: ObjectId,
    },
    ManningArtillery {
        artillery_id: ObjectId,
    },
}

/// Discriminant of [`Occupancy`], used to compare sub-states independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancyKind {
    Vehicle,
    Cart,
    TowedArtillery,
    MannedArtillery,
}

impl OccupancyKind {
    pub const ALL: [OccupancyKind; 4] = [
        OccupancyKind::Vehicle,
        OccupancyKind::Cart,
        OccupancyKind::TowedArtillery,
        OccupancyKind::MannedArtillery,
    ];
}

impl Occupancy {
    pub fn kind(&self) -> OccupancyKind {
        match self {
            Occupancy::Piloting { .. } => OccupancyKind::Vehicle,
            Occupancy::TowingCart { .. } => OccupancyKind::Cart,
            Occupancy::TowingArtillery { .. } => OccupancyKind::TowedArtillery,
            Occupancy::ManningArtillery { .. } => OccupancyKind::MannedArtillery,
        }
    }

    /// The shared object this occupancy holds.
    pub fn object_id(&self) -> &ObjectId {
        match self {
            Occupancy::Piloting { vehicle_id, .. } => vehicle_id,
            Occupancy::TowingCart { cart_id, .. } => cart_id,
            Occupancy::TowingArtillery { artillery_id }
            | Occupancy::ManningArtillery { artillery_id } => artillery_id,
        }
    }

    /// Fresh occupancy of `kind` over `object_id` with no crew or cargo.
    pub fn empty(kind: OccupancyKind, object_id: ObjectId) -> Self {
        match kind {
            OccupancyKind::Vehicle => Occupancy::Piloting {
                vehicle_id: object_id,
                crew: Vec::new(),
            },
            OccupancyKind::Cart => Occupancy::TowingCart {
                cart_id: object_id,
                cargo: Vec::new(),
            },
            OccupancyKind::TowedArtillery => Occupancy::TowingArtillery {
                artillery_id: object_id,
            },
            OccupancyKind::MannedArtillery => Occupancy::ManningArtillery {
                artillery_id: object_id,
            },
        }
    }
}

/// Resource gathering in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestActivity {
    pub node_id: ObjectId,
    pub started_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimbPhase {
    Mounting,
    Climbing,
    Dismounting,
}

/// Everything known locally about one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSyncState {
    pub peer_id: PeerId,
    pub identity: Option<Identity>,
    pub spatial: Option<Spatial>,
    pub occupancy: Option<Occupancy>,
    pub harvest: Option<HarvestActivity>,
    pub climbing: Option<ClimbPhase>,
    /// Whether a local visual representation is attached.
    pub has_avatar: bool,
    /// Whether an avatar has been asked for and not yet attached.
    pub avatar_requested: bool,
}

impl PeerSyncState {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            identity: None,
            spatial: None,
            occupancy: None,
            harvest: None,
            climbing: None,
            has_avatar: false,
            avatar_requested: false,
        }
    }

    /// Occupancy if it is of the given kind.
    pub fn occupancy_of(&self, kind: OccupancyKind) -> Option<&Occupancy> {
        self.occupancy.as_ref().filter(|o| o.kind() == kind)
    }

    pub fn spawn_time(&self) -> Option<Millis> {
        self.identity.as_ref().and_then(|i| i.spawn_time)
    }

    pub fn current_cell(&self) -> Option<CellKey> {
        self.spatial.and_then(|s| s.current_cell)
    }
}
