//! Session events and the bus that delivers them.
//!
//! The orchestrator never calls UI or game code directly. It publishes typed
//! [`SessionEvent`]s on an [`EventBus`], and collaborators subscribe either to
//! everything or to one [`SessionEventKind`].
//!
//! Handlers run synchronously inside `publish`, on the event loop, in
//! subscription order.

use meshsync_core::{Millis, PeerId};
use meshsync_reconcile::ReconcileEffect;
use meshsync_transport::CandidateType;

/// Events with a discriminant that subscribers can filter on.
pub trait EventKind {
    type Kind: Copy + Eq;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber<E: EventKind> {
    id: SubscriptionId,
    filter: Option<E::Kind>,
    handler: Box<dyn FnMut(&E)>,
}

/// Minimal single-threaded publish/subscribe.
pub struct EventBus<E: EventKind> {
    next_id: u64,
    subscribers: Vec<Subscriber<E>>,
}

impl<E: EventKind> EventBus<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }

    /// Receive every event.
    pub fn subscribe(&mut self, handler: impl FnMut(&E) + 'static) -> SubscriptionId {
        self.add(None, Box::new(handler))
    }

    /// Receive only events of `kind`.
    pub fn subscribe_kind(
        &mut self,
        kind: E::Kind,
        handler: impl FnMut(&E) + 'static,
    ) -> SubscriptionId {
        self.add(Some(kind), Box::new(handler))
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Deliver `event` to matching subscribers; returns how many received it.
    pub fn publish(&mut self, event: &E) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for subscriber in &mut self.subscribers {
            if subscriber.filter.map_or(true, |k| k == kind) {
                (subscriber.handler)(event);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn add(&mut self, filter: Option<E::Kind>, handler: Box<dyn FnMut(&E)>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            filter,
            handler,
        });
        id
    }
}

impl<E: EventKind> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the session tells the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The relay accepted us under `client_id`.
    Connected { client_id: PeerId },
    /// The relay session dropped; a reconnect may follow.
    RelayDisconnected,
    Reconnecting { attempt: u32, max: u32 },
    /// The relay will not be retried. No reason is given.
    ConnectionFailed,

    PeerConnected {
        peer_id: PeerId,
        candidate: Option<CandidateType>,
    },
    /// A link failed and another attempt is scheduled.
    PeerRetrying { peer_id: PeerId, attempt: u32, max: u32 },
    /// Retries ran out and the remote side was removed.
    PeerEliminated { peer_id: PeerId },
    /// Retries ran out and the local side lost arbitration.
    EliminatedSelf { conflicting_peer: PeerId },
    /// The relay reported a peer's death.
    PeerDied { peer_id: PeerId },

    /// Reconciled state changed.
    State(ReconcileEffect),

    /// Local respawn started at the given spawn time.
    Respawning { spawn_time: Millis },
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Connected,
    RelayDisconnected,
    Reconnecting,
    ConnectionFailed,
    PeerConnected,
    PeerRetrying,
    PeerEliminated,
    EliminatedSelf,
    PeerDied,
    State,
    Respawning,
    LoggedOut,
}

impl EventKind for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Connected { .. } => SessionEventKind::Connected,
            SessionEvent::RelayDisconnected => SessionEventKind::RelayDisconnected,
            SessionEvent::Reconnecting { .. } => SessionEventKind::Reconnecting,
            SessionEvent::ConnectionFailed => SessionEventKind::ConnectionFailed,
            SessionEvent::PeerConnected { .. } => SessionEventKind::PeerConnected,
            SessionEvent::PeerRetrying { .. } => SessionEventKind::PeerRetrying,
            SessionEvent::PeerEliminated { .. } => SessionEventKind::PeerEliminated,
            SessionEvent::EliminatedSelf { .. } => SessionEventKind::EliminatedSelf,
            SessionEvent::PeerDied { .. } => SessionEventKind::PeerDied,
            SessionEvent::State(_) => SessionEventKind::State,
            SessionEvent::Respawning { .. } => SessionEventKind::Respawning,
            SessionEvent::LoggedOut => SessionEventKind::LoggedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(bus: &mut EventBus<SessionEvent>) -> Rc<RefCell<Vec<SessionEvent>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |e| sink.borrow_mut().push(e.clone()));
        seen
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let mut bus = EventBus::new();
        let a = recorder(&mut bus);
        let b = recorder(&mut bus);

        assert_eq!(bus.publish(&SessionEvent::ConnectionFailed), 2);
        assert_eq!(a.borrow().len(), 1);
        assert_eq!(b.borrow()[0], SessionEvent::ConnectionFailed);
    }

    #[test]
    fn test_kind_filter() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        bus.subscribe_kind(SessionEventKind::LoggedOut, move |_| *c.borrow_mut() += 1);

        bus.publish(&SessionEvent::ConnectionFailed);
        bus.publish(&SessionEvent::LoggedOut);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut bus: EventBus<SessionEvent> = EventBus::new();
        let id = bus.subscribe(|_| {});
        assert_eq!(bus.len(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&SessionEvent::LoggedOut), 0);
    }
}
