//! Deferred work.
//!
//! Timers are the only source of deferred work in meshsync. Each scheduled
//! timer gets a fresh [`TimerId`]; ids are never reused, so an id acts as a
//! generation: once cancelled, a late expiry for that id is impossible.
//! Owners cancel every timer that references an entity when the entity is
//! destroyed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::types::Millis;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A queue of keyed deadlines.
#[derive(Debug)]
pub struct TimerQueue<K> {
    next_id: u64,
    /// Min-heap of (deadline, id); may contain cancelled ids.
    heap: BinaryHeap<Reverse<(Millis, u64)>>,
    /// Live timers.
    armed: HashMap<u64, (Millis, K)>,
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
        }
    }

    /// Schedule `key` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Millis, key: K) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.armed.insert(id, (deadline, key));
        TimerId(id)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id.0).is_some()
    }

    /// Cancel every timer whose key matches. Returns how many were cancelled.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let before = self.armed.len();
        self.armed.retain(|_, (_, key)| !pred(key));
        before - self.armed.len()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id.0)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.armed.values().map(|(deadline, _)| *deadline).min()
    }

    /// Remove and return every live timer due at or before `now`, earliest
    /// first. Timers due at the same instant fire in scheduling order.
    pub fn pop_expired(&mut self, now: Millis) -> Vec<(TimerId, K)> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some((_, key)) = self.armed.remove(&id) {
                fired.push((TimerId(id), key));
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Cancel everything.
    pub fn clear(&mut self) {
        self.armed.clear();
        self.heap.clear();
    }
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
