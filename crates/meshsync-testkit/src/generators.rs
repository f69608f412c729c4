//! Proptest generators for property-based testing.

use proptest::prelude::*;

use meshsync_core::{
    ClimbPhase, FullStateSnapshot, HarvestActivity, Identity, Millis, ObjectId, Occupancy,
    PeerId, PositionPayload, Vec3,
};

/// Generate a numeric peer id, as the relay assigns them.
pub fn numeric_peer_id() -> impl Strategy<Value = PeerId> {
    (1u32..10_000).prop_map(|n| PeerId::from(n.to_string()))
}

/// Generate a peer id, numeric or not.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    prop_oneof![numeric_peer_id(), "[a-z][a-z0-9]{0,7}".prop_map(PeerId::from)]
}

/// Generate two distinct peer ids.
pub fn peer_pair() -> impl Strategy<Value = (PeerId, PeerId)> {
    (peer_id(), peer_id()).prop_filter("distinct", |(a, b)| a != b)
}

/// Generate a shared object id.
pub fn object_id() -> impl Strategy<Value = ObjectId> {
    "(veh|cart|art)-[0-9]{1,3}".prop_map(ObjectId::from)
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = Millis> {
    0u64..=1_000_000_000
}

pub fn vec3() -> impl Strategy<Value = Vec3> {
    (-1_000.0f32..1_000.0, 0.0f32..100.0, -1_000.0f32..1_000.0)
        .prop_map(|(x, y, z)| Vec3::new(x, y, z))
}

pub fn identity() -> impl Strategy<Value = Identity> {
    (
        "[a-z]{3,10}",
        proptest::option::of("[a-z]{3}"),
        proptest::option::of(timestamp()),
    )
        .prop_map(|(name, faction_id, spawn_time)| Identity {
            account_id: format!("acct-{name}"),
            username: name,
            faction_id,
            spawn_time,
        })
}

/// Generate an occupancy of any kind, without crew or cargo.
pub fn occupancy() -> impl Strategy<Value = Occupancy> {
    (0usize..4, object_id()).prop_map(|(i, object_id)| {
        Occupancy::empty(meshsync_core::OccupancyKind::ALL[i], object_id)
    })
}

pub fn climb_phase() -> impl Strategy<Value = ClimbPhase> {
    prop_oneof![
        Just(ClimbPhase::Mounting),
        Just(ClimbPhase::Climbing),
        Just(ClimbPhase::Dismounting),
    ]
}

pub fn harvest() -> impl Strategy<Value = HarvestActivity> {
    (object_id(), timestamp()).prop_map(|(node_id, started_at)| HarvestActivity {
        node_id,
        started_at,
    })
}

pub fn position() -> impl Strategy<Value = PositionPayload> {
    (vec3(), -3.0f32..3.0, timestamp()).prop_map(|(position, rotation, timestamp)| {
        PositionPayload {
            position,
            rotation,
            timestamp,
        }
    })
}

/// Generate a full-state snapshot with every sub-state optional.
pub fn snapshot() -> impl Strategy<Value = FullStateSnapshot> {
    (
        proptest::option::of(identity()),
        proptest::option::of(position()),
        proptest::option::of(occupancy()),
        proptest::option::of(harvest()),
        proptest::option::of(climb_phase()),
        timestamp(),
    )
        .prop_map(
            |(identity, position, occupancy, harvest, climbing, taken_at)| FullStateSnapshot {
                identity,
                position,
                occupancy,
                harvest,
                climbing,
                taken_at,
            },
        )
}

/// Gaps in milliseconds between consecutive link failures.
pub fn failure_gaps(max_failures: usize) -> impl Strategy<Value = Vec<Millis>> {
    prop::collection::vec(0u64..15_000, 1..=max_failures)
}
