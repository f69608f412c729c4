//! Communication-free conflict resolution.
//!
//! Both rules take inputs every observer already holds and must produce the
//! same answer regardless of which side evaluates them or in which argument
//! order.

use std::cmp::Ordering;

use meshsync_core::{Millis, PeerId};

/// Winner of two claims on the same shared object: the lower identity.
///
/// Claim timestamps come from unsynchronised clocks and do not take part in
/// the decision.
pub fn claim_winner<'a>(a: &'a PeerId, b: &'a PeerId) -> &'a PeerId {
    match a.cmp_identity(b) {
        Ordering::Greater => b,
        _ => a,
    }
}

/// One side of a failed link, as both ends know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub peer_id: PeerId,
    /// Last known authoritative spawn timestamp.
    pub spawn_time: Option<Millis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EliminationVerdict {
    LocalLoses,
    RemoteLoses,
}

/// Decide which side gives up after retries are exhausted.
///
/// 1. The more recent spawn timestamp loses.
/// 2. If equal or unknown on either side, the larger identity loses.
pub fn arbitrate_elimination(local: &Participant, remote: &Participant) -> EliminationVerdict {
    let by_spawn = match (local.spawn_time, remote.spawn_time) {
        (Some(l), Some(r)) => l.cmp(&r),
        _ => Ordering::Equal,
    };
    let order = by_spawn.then_with(|| local.peer_id.cmp_identity(&remote.peer_id));
    match order {
        Ordering::Greater => EliminationVerdict::LocalLoses,
        // Equal only when both sides are the same participant.
        Ordering::Less | Ordering::Equal => EliminationVerdict::RemoteLoses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn participant(id: &str, spawn: Option<Millis>) -> Participant {
        Participant {
            peer_id: PeerId::from(id),
            spawn_time: spawn,
        }
    }

    #[test]
    fn test_lower_identity_wins_claim() {
        let five = PeerId::from("5");
        let nine = PeerId::from("9");
        assert_eq!(claim_winner(&five, &nine), &five);
        assert_eq!(claim_winner(&nine, &five), &five);
    }

    #[test]
    fn test_numeric_not_lexical_claim() {
        let ten = PeerId::from("10");
        let nine = PeerId::from("9");
        assert_eq!(claim_winner(&ten, &nine), &nine);
    }

    #[test]
    fn test_newer_spawn_loses() {
        let local = participant("1", Some(2_000));
        let remote = participant("9", Some(1_000));
        assert_eq!(
            arbitrate_elimination(&local, &remote),
            EliminationVerdict::LocalLoses
        );
        assert_eq!(
            arbitrate_elimination(&remote, &local),
            EliminationVerdict::RemoteLoses
        );
    }

    #[test]
    fn test_equal_spawn_falls_back_to_identity() {
        let local = participant("9", Some(1_000));
        let remote = participant("5", Some(1_000));
        assert_eq!(
            arbitrate_elimination(&local, &remote),
            EliminationVerdict::LocalLoses
        );
    }

    #[test]
    fn test_unknown_spawn_falls_back_to_identity() {
        let local = participant("3", None);
        let remote = participant("4", Some(1));
        assert_eq!(
            arbitrate_elimination(&local, &remote),
            EliminationVerdict::RemoteLoses
        );
    }

    proptest! {
        #[test]
        fn claim_winner_is_order_independent(
            a in 0u32..1000,
            b in 0u32..1000,
            _ta in any::<u64>(),
            _tb in any::<u64>(),
        ) {
            let a = PeerId::from(a.to_string());
            let b = PeerId::from(b.to_string());
            prop_assert_eq!(claim_winner(&a, &b), claim_winner(&b, &a));
        }

        #[test]
        fn elimination_is_symmetric(
            a in 0u32..1000,
            b in 0u32..1000,
            sa in proptest::option::of(0u64..10),
            sb in proptest::option::of(0u64..10),
        ) {
            prop_assume!(a != b);
            let pa = participant(&a.to_string(), sa);
            let pb = participant(&b.to_string(), sb);
            let from_a = arbitrate_elimination(&pa, &pb);
            let from_b = arbitrate_elimination(&pb, &pa);
            // Exactly one side is removed.
            prop_assert_ne!(from_a, from_b);
        }
    }
}
