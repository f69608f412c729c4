//! Properties over generated peers, positions and snapshots.

use meshsync::reconcile::{claim_winner, ReconcilerConfig, StateReconciler};
use meshsync::{ClaimKind, PeerId, PeerMessage, ReconcileEffect, SessionEvent};
use meshsync_testkit::generators::{object_id, peer_id, peer_pair, position, snapshot};
use meshsync_testkit::TestFixture;
use proptest::prelude::*;

fn structural(events: &[SessionEvent]) -> Vec<&ReconcileEffect> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::State(
                effect @ (ReconcileEffect::Teardown { .. } | ReconcileEffect::Construct { .. }),
            ) => Some(effect),
            _ => None,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reapplied_snapshot_changes_nothing(snap in snapshot()) {
        let mut f = TestFixture::new("1");
        let peer = PeerId::from("2");
        f.proximity(&["2"]);
        f.open_link("2");

        f.peer_data("2", &PeerMessage::FullState(snap.clone()));
        f.session.attach_avatar(&peer);
        prop_assert!(f.session.reconciler().peer(&peer).is_some_and(|s| s.has_avatar));

        f.clear_events();
        f.peer_data("2", &PeerMessage::FullState(snap));
        prop_assert!(structural(&f.events()).is_empty());
    }

    #[test]
    fn claim_conflicts_converge((a, b) in peer_pair(), object in object_id()) {
        let mut side_a = StateReconciler::new(a.clone(), ReconcilerConfig::default());
        let mut side_b = StateReconciler::new(b.clone(), ReconcilerConfig::default());

        let claim_a = side_a.claim_local(object.clone(), ClaimKind::Pilot, 10).unwrap();
        let claim_b = side_b.claim_local(object.clone(), ClaimKind::Pilot, 20).unwrap();
        side_a.apply(&b, claim_b);
        side_b.apply(&a, claim_a);

        let winner = claim_winner(&a, &b).clone();
        prop_assert_eq!(side_a.holder_of(&object), Some(&winner));
        prop_assert_eq!(side_b.holder_of(&object), Some(&winner));
        prop_assert_eq!(side_a.local().occupancy.is_some(), winner == a);
        prop_assert_eq!(side_b.local().occupancy.is_some(), winner == b);
    }

    #[test]
    fn positions_keep_latest_timestamp(
        peer in peer_id(),
        updates in prop::collection::vec(position(), 1..20),
    ) {
        let mut r = StateReconciler::new(PeerId::from("local-0"), ReconcilerConfig::default());
        for update in &updates {
            r.apply(&peer, PeerMessage::Position(update.clone()));
        }

        let latest = updates.iter().map(|u| u.timestamp).max();
        let state = r.peer(&peer).unwrap();
        prop_assert_eq!(state.spatial.as_ref().map(|s| s.last_update_time), latest);
    }
}
