//! Status Broadcasting
//!
//! Fan-out of [`StatusSnapshot`] updates to registered listeners. A
//! listener subscribes with a closure and receives a token; dropping out
//! is explicit via [`StatusBroadcaster::unsubscribe`] with that token, so
//! two listeners registered from the same call site never collide.
//!
//! Publishing is synchronous and in registration order. The listener list
//! is snapshotted before delivery: a listener that subscribes or
//! unsubscribes while a publish is running takes effect from the next
//! publish, and a listener may call back into the broadcaster without
//! deadlocking.

use std::sync::{Arc, Mutex, PoisonError};

use crate::model::StatusSnapshot;

/// Opaque handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
}

/// Synchronous status fan-out with token-based unsubscription
#[derive(Default)]
pub struct StatusBroadcaster {
    inner: Mutex<Registry>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns the token needed to unsubscribe it.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if the token is unknown,
    /// e.g. already unsubscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|(entry, _)| *entry != id);
        registry.listeners.len() != before
    }

    /// Deliver a snapshot to every listener, in registration order.
    pub fn publish(&self, snapshot: &StatusSnapshot) {
        // Snapshot the list so listeners can re-enter the broadcaster
        let listeners: Vec<Listener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionState;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot::new(ConnectionState::Disconnected, None)
    }

    #[test]
    fn test_publish_in_registration_order() {
        let broadcaster = StatusBroadcaster::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            broadcaster.subscribe(move |_| order.lock().unwrap().push(tag));
        }
        broadcaster.publish(&snapshot());

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribed_listener_not_delivered() {
        let broadcaster = StatusBroadcaster::new();
        let hits = Arc::new(Mutex::new(0usize));

        let hits_clone = Arc::clone(&hits);
        let id = broadcaster.subscribe(move |_| *hits_clone.lock().unwrap() += 1);

        broadcaster.publish(&snapshot());
        assert!(broadcaster.unsubscribe(id));
        broadcaster.publish(&snapshot());

        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe_unknown_token_returns_false() {
        let broadcaster = StatusBroadcaster::new();
        let id = broadcaster.subscribe(|_| {});
        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
    }

    #[test]
    fn test_tokens_distinct_per_subscription() {
        let broadcaster = StatusBroadcaster::new();
        let a = broadcaster.subscribe(|_| {});
        let b = broadcaster.subscribe(|_| {});
        assert_ne!(a, b);

        // removing one leaves the other registered
        assert!(broadcaster.unsubscribe(a));
        assert_eq!(broadcaster.listener_count(), 1);
        assert!(broadcaster.unsubscribe(b));
    }

    #[test]
    fn test_subscribe_during_publish_joins_next_cycle() {
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let late_hits = Arc::new(Mutex::new(0usize));

        let inner = Arc::clone(&broadcaster);
        let late = Arc::clone(&late_hits);
        broadcaster.subscribe(move |_| {
            let late = Arc::clone(&late);
            inner.subscribe(move |_| *late.lock().unwrap() += 1);
        });

        broadcaster.publish(&snapshot());
        assert_eq!(*late_hits.lock().unwrap(), 0);

        broadcaster.publish(&snapshot());
        assert_eq!(*late_hits.lock().unwrap(), 1);
    }
}
