//! Full-state snapshots.
//!
//! A snapshot describes one participant's complete synchronisable state. It is
//! sent on first contact and periodically afterwards so that peers recover
//! from lost incremental updates without a delta history.

use serde::{Deserialize, Serialize};

use crate::message::PositionPayload;
use crate::state::{ClimbPhase, HarvestActivity, Identity, Occupancy, OccupancyKind};
use crate::types::Millis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStateSnapshot {
    pub identity: Option<Identity>,
    pub position: Option<PositionPayload>,
    pub occupancy: Option<Occupancy>,
    pub harvest: Option<HarvestActivity>,
    pub climbing: Option<ClimbPhase>,
    /// When the sender built this snapshot, on the sender's clock.
    pub taken_at: Millis,
}

impl FullStateSnapshot {
    /// An empty snapshot, used before any local state exists.
    pub fn empty(taken_at: Millis) -> Self {
        Self {
            identity: None,
            position: None,
            occupancy: None,
            harvest: None,
            climbing: None,
            taken_at,
        }
    }

    /// Occupancy if it is of the given kind.
    pub fn occupancy_of(&self, kind: OccupancyKind) -> Option<&Occupancy> {
        self.occupancy.as_ref().filter(|o| o.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectId;

    #[test]
    fn test_snapshot_json_is_self_describing() {
        let mut snapshot = FullStateSnapshot::empty(100);
        snapshot.occupancy = Some(Occupancy::empty(OccupancyKind::Vehicle, ObjectId::from("v-1")));
        snapshot.climbing = Some(ClimbPhase::Climbing);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["occupancy"]["kind"], "piloting");
        assert_eq!(json["climbing"], "climbing");
        assert!(json["harvest"].is_null());
    }
}
