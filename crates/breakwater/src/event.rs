//! Per-instance lifecycle event publication.
//!
//! Every primitive owns an [`EventPublisher`] for its typed event record.
//! Two consumption modes are supported:
//!
//! - **Callback consumers** registered with [`EventPublisher::on_event`] (or
//!   the per-kind helpers each primitive exposes). They run inline on the
//!   publishing thread; a consumer that panics is logged and discarded and
//!   never poisons the producer.
//! - **Ring subscriptions** created with [`EventPublisher::subscribe`]. Each
//!   subscription owns an independent bounded ring; publishing never blocks,
//!   and on overflow the oldest event is dropped and counted.
//!
//! Events from a single instance are delivered in the order the causing
//! thread generated them. No ordering is promised across instances.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::warn;

type Consumer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out point for one primitive instance's events.
pub struct EventPublisher<E> {
    consumers: RwLock<Vec<Consumer<E>>>,
    rings: RwLock<Vec<Weak<SubscriptionShared<E>>>>,
}

struct SubscriptionShared<E> {
    buffered: Mutex<VecDeque<E>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<E> SubscriptionShared<E> {
    /// Appends one event, displacing the oldest buffered one when the
    /// subscription is at capacity.
    fn offer(&self, event: E) {
        let mut buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
        buffered.push_back(event);
        if buffered.len() > self.capacity {
            buffered.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A bounded, independently-drained view of one publisher's events.
///
/// Dropping the subscription detaches it; the publisher prunes dead
/// subscriptions on its next publication.
pub struct EventSubscription<E> {
    shared: Arc<SubscriptionShared<E>>,
}

impl<E> EventPublisher<E> {
    pub fn new() -> Self {
        Self { consumers: RwLock::new(Vec::new()), rings: RwLock::new(Vec::new()) }
    }

    /// Registers a callback invoked inline for every published event.
    pub fn on_event(&self, consumer: impl Fn(&E) + Send + Sync + 'static) {
        let mut consumers =
            self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        consumers.push(Arc::new(consumer));
    }

    /// Creates a ring subscription buffering up to `capacity` events
    /// (clamped to at least one).
    pub fn subscribe(&self, capacity: usize) -> EventSubscription<E> {
        let shared = Arc::new(SubscriptionShared {
            buffered: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        let mut rings = self.rings.write().unwrap_or_else(PoisonError::into_inner);
        rings.push(Arc::downgrade(&shared));
        EventSubscription { shared }
    }

    /// True when at least one callback or live subscription is attached.
    /// Producers may use this to skip building event payloads.
    pub fn has_consumers(&self) -> bool {
        let has_callbacks =
            !self.consumers.read().unwrap_or_else(PoisonError::into_inner).is_empty();
        if has_callbacks {
            return true;
        }
        self.rings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|w| w.strong_count() > 0)
    }
}

impl<E: Clone> EventPublisher<E> {
    /// Publishes one event to every consumer and subscription.
    ///
    /// Callback panics are caught and logged; ring overflow drops the oldest
    /// buffered event and increments that subscription's drop counter. The
    /// producer is never blocked.
    pub fn publish(&self, event: E) {
        let consumers: Vec<Consumer<E>> =
            self.consumers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for consumer in consumers {
            let outcome = catch_unwind(AssertUnwindSafe(|| consumer(&event)));
            if outcome.is_err() {
                warn!("event consumer panicked; dropping the panic");
            }
        }

        let rings: Vec<Weak<SubscriptionShared<E>>> =
            self.rings.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut dead = false;
        for weak in &rings {
            match weak.upgrade() {
                Some(shared) => shared.offer(event.clone()),
                None => dead = true,
            }
        }
        if dead {
            let mut rings = self.rings.write().unwrap_or_else(PoisonError::into_inner);
            rings.retain(|w| w.strong_count() > 0);
        }
    }
}

impl<E> Default for EventPublisher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventPublisher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

impl<E> EventSubscription<E> {
    /// Removes and returns the oldest buffered event.
    pub fn poll(&self) -> Option<E> {
        self.shared.buffered.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Removes and returns every buffered event, oldest first.
    pub fn drain(&self) -> Vec<E> {
        let mut buffered = self.shared.buffered.lock().unwrap_or_else(PoisonError::into_inner);
        buffered.drain(..).collect()
    }

    /// Number of events lost to overflow since the subscription was created.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.shared.buffered.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    /// Callback consumers see every event in publication order.
    #[test]
    fn test_callbacks_receive_events_in_order() {
        let publisher = EventPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        publisher.on_event(move |e: &u32| sink.lock().unwrap().push(*e));

        publisher.publish(1);
        publisher.publish(2);
        publisher.publish(3);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    /// A panicking consumer does not prevent delivery to the others.
    #[test]
    fn test_panicking_consumer_is_isolated() {
        let publisher = EventPublisher::new();
        publisher.on_event(|_: &u32| panic!("bad consumer"));

        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        publisher.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(7);
        publisher.publish(8);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    /// Ring overflow drops the oldest event and counts the loss.
    #[test]
    fn test_subscription_overflow_drops_oldest() {
        let publisher = EventPublisher::new();
        let sub = publisher.subscribe(2);

        publisher.publish(1);
        publisher.publish(2);
        publisher.publish(3);

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.drain(), vec![2, 3]);
    }

    /// A dropped subscription stops receiving without affecting others.
    #[test]
    fn test_dropped_subscription_is_pruned() {
        let publisher = EventPublisher::new();
        let kept = publisher.subscribe(8);
        let gone = publisher.subscribe(8);
        drop(gone);

        publisher.publish(1);
        publisher.publish(2);

        assert_eq!(kept.drain(), vec![1, 2]);
        assert!(publisher.has_consumers());
        drop(kept);
        publisher.publish(3);
        assert!(!publisher.has_consumers());
    }
}
