//! FIFO buffer between frame arrival and processing.

use std::collections::{vec_deque::Drain, VecDeque};

use meshsync_core::{Millis, PeerId};

/// Which channel a message arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    Relay,
    Mesh(PeerId),
}

/// A buffered message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage<T> {
    pub payload: T,
    pub source: MessageSource,
    pub arrived_at: Millis,
}

/// First-in first-out message buffer.
///
/// Order is exactly arrival order; there is no prioritisation by type.
#[derive(Debug)]
pub struct MessageQueue<T> {
    inner: VecDeque<QueuedMessage<T>>,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, payload: T, source: MessageSource, arrived_at: Millis) {
        self.inner.push_back(QueuedMessage {
            payload,
            source,
            arrived_at,
        });
    }

    pub fn dequeue(&mut self) -> Option<QueuedMessage<T>> {
        self.inner.pop_front()
    }

    pub fn has_messages(&self) -> bool {
        !self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Take at most `max` messages from the front. The rest wait for the
    /// next call.
    pub fn drain(&mut self, max: usize) -> Drain<'_, QueuedMessage<T>> {
        let n = max.min(self.inner.len());
        self.inner.drain(..n)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_drain_is_bounded() {
        let mut queue = MessageQueue::new();
        for i in 0..10 {
            queue.enqueue(i, MessageSource::Relay, i as Millis);
        }

        let first: Vec<_> = queue.drain(4).map(|m| m.payload).collect();
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 6);
        assert!(queue.has_messages());

        let rest: Vec<_> = queue.drain(100).map(|m| m.payload).collect();
        assert_eq!(rest, vec![4, 5, 6, 7, 8, 9]);
        assert!(!queue.has_messages());
    }

    #[test]
    fn test_dequeue_empty() {
        let mut queue: MessageQueue<()> = MessageQueue::new();
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.drain(5).count(), 0);
    }

    #[test]
    fn test_source_is_kept() {
        let mut queue = MessageQueue::new();
        queue.enqueue("a", MessageSource::Mesh(PeerId::from("3")), 7);
        let msg = queue.dequeue().unwrap();
        assert_eq!(msg.source, MessageSource::Mesh(PeerId::from("3")));
        assert_eq!(msg.arrived_at, 7);
    }

    proptest! {
        #[test]
        fn fifo_order_preserved(items in prop::collection::vec(any::<u32>(), 0..200)) {
            let mut queue = MessageQueue::new();
            for (i, item) in items.iter().enumerate() {
                queue.enqueue(*item, MessageSource::Relay, i as Millis);
            }
            let mut out = Vec::new();
            while let Some(msg) = queue.dequeue() {
                out.push(msg.payload);
            }
            prop_assert_eq!(out, items);
        }

        #[test]
        fn bounded_drains_preserve_order(
            items in prop::collection::vec(any::<u8>(), 0..100),
            batch in 1usize..16,
        ) {
            let mut queue = MessageQueue::new();
            for item in &items {
                queue.enqueue(*item, MessageSource::Relay, 0);
            }
            let mut out = Vec::new();
            while queue.has_messages() {
                let before = out.len();
                out.extend(queue.drain(batch).map(|m| m.payload));
                prop_assert!(out.len() - before <= batch);
            }
            prop_assert_eq!(out, items);
        }
    }
}
