//! Full-snapshot application and per-sub-state comparison.
//!
//! Every sub-state is compared on its own:
//!
//! | local   | incoming | result                         |
//! |---------|----------|--------------------------------|
//! | absent  | absent   | nothing                        |
//! | absent  | present  | construct                      |
//! | present | absent   | tear down                      |
//! | present | present  | update targets                 |
//!
//! When both are present but refer to different objects, the old one is torn
//! down and the new one constructed. Teardowns are always emitted before
//! constructions.

use meshsync_core::{
    ClimbPhase, FullStateSnapshot, HarvestActivity, ObjectId, Occupancy, OccupancyKind, PeerId,
    PeerMessage, PeerSyncState,
};

use crate::effects::{ReconcileEffect, SubState};
use crate::reconciler::StateReconciler;

impl StateReconciler {
    /// Apply a full snapshot received from `from`.
    pub fn apply_snapshot(
        &mut self,
        from: &PeerId,
        snapshot: FullStateSnapshot,
    ) -> Vec<ReconcileEffect> {
        self.apply(from, PeerMessage::FullState(snapshot))
    }

    pub(crate) fn apply_snapshot_to(
        &mut self,
        state: &mut PeerSyncState,
        snapshot: FullStateSnapshot,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        if let Some(identity) = snapshot.identity {
            self.apply_identity(state, identity, effects);
        }
        if let Some(position) = snapshot.position {
            self.apply_position(state, position, effects);
        }

        let occupancy = match snapshot.occupancy {
            Some(incoming) if self.may_hold(&state.peer_id, incoming.object_id(), effects) => {
                Some(incoming)
            }
            Some(_) => state.occupancy.clone().filter(|current| {
                // Keep whatever else the peer held; the contested object is lost.
                self.holders.get(current.object_id()) == Some(&state.peer_id)
            }),
            None => None,
        };
        self.reconcile_occupancy(state, occupancy, effects);
        self.reconcile_harvest(state, snapshot.harvest, effects);
        self.reconcile_climbing(state, snapshot.climbing, effects);
    }

    pub(crate) fn reconcile_occupancy(
        &mut self,
        state: &mut PeerSyncState,
        incoming: Option<Occupancy>,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        let mut changes = Vec::new();
        for kind in OccupancyKind::ALL {
            let current = state.occupancy_of(kind).map(|o| Some(o.object_id()));
            let next = incoming
                .as_ref()
                .filter(|o| o.kind() == kind)
                .map(|o| Some(o.object_id()));
            changes.extend(compare(&state.peer_id, SubState::Occupancy(kind), current, next));
        }
        order_teardowns_first(&mut changes);

        if let Some(current) = &state.occupancy {
            let moved = incoming
                .as_ref()
                .map_or(true, |o| o.object_id() != current.object_id());
            if moved && self.holders.get(current.object_id()) == Some(&state.peer_id) {
                self.holders.remove(current.object_id());
            }
        }
        if let Some(next) = &incoming {
            self.holders
                .insert(next.object_id().clone(), state.peer_id.clone());
        }
        state.occupancy = incoming;

        if state.has_avatar {
            effects.extend(changes);
        }
    }

    pub(crate) fn reconcile_harvest(
        &mut self,
        state: &mut PeerSyncState,
        incoming: Option<HarvestActivity>,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        let mut changes = compare(
            &state.peer_id,
            SubState::Harvest,
            state.harvest.as_ref().map(|h| Some(&h.node_id)),
            incoming.as_ref().map(|h| Some(&h.node_id)),
        );
        order_teardowns_first(&mut changes);
        state.harvest = incoming;
        if state.has_avatar {
            effects.extend(changes);
        }
    }

    pub(crate) fn reconcile_climbing(
        &mut self,
        state: &mut PeerSyncState,
        incoming: Option<ClimbPhase>,
        effects: &mut Vec<ReconcileEffect>,
    ) {
        let changes = compare(
            &state.peer_id,
            SubState::Climbing,
            state.climbing.map(|_| None),
            incoming.map(|_| None),
        );
        state.climbing = incoming;
        if state.has_avatar {
            effects.extend(changes);
        }
    }
}

/// Compare one sub-state. The inner option is the object it refers to, if
/// any.
fn compare(
    peer_id: &PeerId,
    sub_state: SubState,
    current: Option<Option<&ObjectId>>,
    next: Option<Option<&ObjectId>>,
) -> Vec<ReconcileEffect> {
    let teardown = |object_id: Option<&ObjectId>| ReconcileEffect::Teardown {
        peer_id: peer_id.clone(),
        sub_state,
        object_id: object_id.cloned(),
    };
    let construct = |object_id: Option<&ObjectId>| ReconcileEffect::Construct {
        peer_id: peer_id.clone(),
        sub_state,
        object_id: object_id.cloned(),
    };

    match (current, next) {
        (None, None) => Vec::new(),
        (None, Some(n)) => vec![construct(n)],
        (Some(c), None) => vec![teardown(c)],
        (Some(c), Some(n)) if c == n => vec![ReconcileEffect::UpdateTargets {
            peer_id: peer_id.clone(),
            sub_state,
        }],
        (Some(c), Some(n)) => vec![teardown(c), construct(n)],
    }
}

fn order_teardowns_first(effects: &mut [ReconcileEffect]) {
    effects.sort_by_key(|e| !matches!(e, ReconcileEffect::Teardown { .. }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcilerConfig;
    use meshsync_core::{Identity, PositionPayload, Vec3};
    use proptest::prelude::*;

    fn attached(local: &str, peer: &PeerId) -> StateReconciler {
        let mut r = StateReconciler::new(PeerId::from(local), ReconcilerConfig::default());
        r.apply(
            peer,
            PeerMessage::Position(PositionPayload {
                position: Vec3::default(),
                rotation: 0.0,
                timestamp: 0,
            }),
        );
        r.attach_avatar(peer);
        r
    }

    fn snapshot(occupancy: Option<Occupancy>, climbing: Option<ClimbPhase>) -> FullStateSnapshot {
        FullStateSnapshot {
            identity: Some(Identity {
                account_id: "acct".into(),
                username: "bob".into(),
                faction_id: Some("red".into()),
                spawn_time: Some(10),
            }),
            position: Some(PositionPayload {
                position: Vec3::new(3.0, 0.0, 4.0),
                rotation: 1.0,
                timestamp: 50,
            }),
            occupancy,
            harvest: None,
            climbing,
            taken_at: 50,
        }
    }

    fn structural(effects: &[ReconcileEffect]) -> Vec<&ReconcileEffect> {
        effects.iter().filter(|e| e.is_structural()).collect()
    }

    #[test]
    fn test_four_outcomes() {
        let peer = PeerId::from("2");
        let mut r = attached("1", &peer);
        let vehicle = Occupancy::empty(OccupancyKind::Vehicle, ObjectId::from("v-1"));

        // absent -> present
        let effects = r.apply_snapshot(&peer, snapshot(Some(vehicle.clone()), None));
        assert_eq!(
            structural(&effects),
            vec![&ReconcileEffect::Construct {
                peer_id: peer.clone(),
                sub_state: SubState::Occupancy(OccupancyKind::Vehicle),
                object_id: Some(ObjectId::from("v-1")),
            }]
        );

        // present -> present
        let effects = r.apply_snapshot(&peer, snapshot(Some(vehicle), None));
        assert!(structural(&effects).is_empty());
        assert!(effects.contains(&ReconcileEffect::UpdateTargets {
            peer_id: peer.clone(),
            sub_state: SubState::Occupancy(OccupancyKind::Vehicle),
        }));

        // present -> absent, absent -> absent for climbing
        let effects = r.apply_snapshot(&peer, snapshot(None, None));
        assert_eq!(
            structural(&effects),
            vec![&ReconcileEffect::Teardown {
                peer_id: peer.clone(),
                sub_state: SubState::Occupancy(OccupancyKind::Vehicle),
                object_id: Some(ObjectId::from("v-1")),
            }]
        );
        assert!(r.holder_of(&ObjectId::from("v-1")).is_none());
    }

    #[test]
    fn test_switching_kind_tears_down_first() {
        let peer = PeerId::from("2");
        let mut r = attached("1", &peer);
        r.apply_snapshot(
            &peer,
            snapshot(
                Some(Occupancy::empty(OccupancyKind::Vehicle, ObjectId::from("v-1"))),
                None,
            ),
        );

        let effects = r.apply_snapshot(
            &peer,
            snapshot(
                Some(Occupancy::empty(OccupancyKind::Cart, ObjectId::from("cart-1"))),
                None,
            ),
        );
        let structural = structural(&effects);
        assert!(matches!(structural[0], ReconcileEffect::Teardown { .. }));
        assert!(matches!(structural[1], ReconcileEffect::Construct { .. }));
        assert_eq!(r.holder_of(&ObjectId::from("cart-1")), Some(&peer));
        assert!(r.holder_of(&ObjectId::from("v-1")).is_none());
    }

    #[test]
    fn test_snapshot_without_avatar_stores_state() {
        let mut r = StateReconciler::new(PeerId::from("1"), ReconcilerConfig::default());
        let peer = PeerId::from("2");
        let effects = r.apply_snapshot(
            &peer,
            snapshot(
                Some(Occupancy::empty(OccupancyKind::Cart, ObjectId::from("cart-1"))),
                Some(ClimbPhase::Climbing),
            ),
        );
        assert!(structural(&effects).is_empty());
        assert!(effects.contains(&ReconcileEffect::AvatarRequested { peer_id: peer.clone() }));

        let effects = r.attach_avatar(&peer);
        assert_eq!(structural(&effects).len(), 2);
        assert_eq!(r.peer(&peer).unwrap().spawn_time(), Some(10));
    }

    #[test]
    fn test_snapshot_claim_conflict_with_local() {
        let peer = PeerId::from("2");
        let mut r = attached("8", &peer);
        r.claim_local(ObjectId::from("art-1"), meshsync_core::ClaimKind::TowArtillery, 1)
            .unwrap();

        let effects = r.apply_snapshot(
            &peer,
            snapshot(
                Some(Occupancy::empty(OccupancyKind::TowedArtillery, ObjectId::from("art-1"))),
                None,
            ),
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, ReconcileEffect::ClaimLost { .. })));
        assert_eq!(r.holder_of(&ObjectId::from("art-1")), Some(&peer));
    }

    #[test]
    fn test_snapshot_losing_claim_is_ignored() {
        let peer = PeerId::from("9");
        let mut r = attached("2", &peer);
        r.claim_local(ObjectId::from("art-1"), meshsync_core::ClaimKind::TowArtillery, 1)
            .unwrap();

        r.apply_snapshot(
            &peer,
            snapshot(
                Some(Occupancy::empty(OccupancyKind::TowedArtillery, ObjectId::from("art-1"))),
                None,
            ),
        );
        assert!(r.local().occupancy.is_some());
        assert!(r.peer(&peer).unwrap().occupancy.is_none());
    }

    fn arb_occupancy() -> impl Strategy<Value = Option<Occupancy>> {
        proptest::option::of((0usize..4, 0u8..3).prop_map(|(kind, id)| {
            Occupancy::empty(OccupancyKind::ALL[kind], ObjectId::from(format!("obj-{id}")))
        }))
    }

    fn arb_climb() -> impl Strategy<Value = Option<ClimbPhase>> {
        proptest::option::of(prop_oneof![
            Just(ClimbPhase::Mounting),
            Just(ClimbPhase::Climbing),
            Just(ClimbPhase::Dismounting),
        ])
    }

    fn arb_harvest() -> impl Strategy<Value = Option<HarvestActivity>> {
        proptest::option::of((0u8..3).prop_map(|n| HarvestActivity {
            node_id: ObjectId::from(format!("node-{n}")),
            started_at: 1,
        }))
    }

    proptest! {
        #[test]
        fn reapplying_snapshot_is_idempotent(
            first in (arb_occupancy(), arb_harvest(), arb_climb()),
            second in (arb_occupancy(), arb_harvest(), arb_climb()),
        ) {
            let peer = PeerId::from("2");
            let mut r = attached("1", &peer);

            let mut s1 = snapshot(first.0, first.2);
            s1.harvest = first.1;
            let mut s2 = snapshot(second.0, second.2);
            s2.harvest = second.1;

            r.apply_snapshot(&peer, s1);
            r.apply_snapshot(&peer, s2.clone());
            let after_first = r.peer(&peer).cloned();

            let effects = r.apply_snapshot(&peer, s2);
            prop_assert!(structural(&effects).is_empty());
            prop_assert_eq!(r.peer(&peer).cloned(), after_first);
        }
    }
}
