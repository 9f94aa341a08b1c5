//! Asynchronous, strictly-ordered event delivery (spec §4.9).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use syncstore_core::{Key, PList, Timestamp};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Lifecycle and change events a store emits (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DidLoad,
    DidTearDown,
    DidDelete,
    DidChange {
        values: BTreeMap<Key, Option<PList>>,
        timestamps: BTreeMap<Key, Timestamp>,
    },
    DidSync {
        values: BTreeMap<Key, Option<PList>>,
        timestamps: BTreeMap<Key, Timestamp>,
    },
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A dedicated, ordered event-delivery channel.
///
/// Posting never blocks the caller; each subscriber gets every event in
/// the order it was posted (spec §4.9: "FIFO per subscriber"). Delivery to
/// a subscriber is independent of delivery to any other subscriber, so one
/// slow consumer cannot stall posting or other subscribers.
pub struct NotificationBus {
    subscribers: Mutex<BTreeMap<u64, UnboundedSender<Event>>>,
    posted: AtomicU64,
    delivered: AtomicU64,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            posted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber; returns its id (for `unsubscribe`) and a
    /// receiver the subscriber awaits events on.
    pub fn subscribe(&self) -> (u64, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscribers mutex poisoned")
            .insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscribers mutex poisoned")
            .remove(&id);
    }

    /// Posts `event` to every current subscriber, preserving per-subscriber
    /// ordering relative to prior posts.
    pub fn post(&self, event: Event) {
        self.posted.fetch_add(1, Ordering::SeqCst);
        let subscribers = self.subscribers.lock().expect("subscribers mutex poisoned");
        for sender in subscribers.values() {
            if sender.send(event.clone()).is_ok() {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Number of `post` calls made so far — used by `wait_until_finished`
    /// (spec §4.9) to confirm the bus has caught up.
    pub fn posted_count(&self) -> u64 {
        self.posted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_posted_order() {
        let bus = NotificationBus::new();
        let (_id, mut rx) = bus.subscribe();

        bus.post(Event::DidLoad);
        bus.post(Event::DidTearDown);
        bus.post(Event::DidDelete);

        assert_eq!(rx.recv().await, Some(Event::DidLoad));
        assert_eq!(rx.recv().await, Some(Event::DidTearDown));
        assert_eq!(rx.recv().await, Some(Event::DidDelete));
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_every_event() {
        let bus = NotificationBus::new();
        let (_id_a, mut rx_a) = bus.subscribe();
        let (id_b, mut rx_b) = bus.subscribe();

        bus.post(Event::DidLoad);
        bus.unsubscribe(id_b);
        bus.post(Event::DidTearDown);

        assert_eq!(rx_a.recv().await, Some(Event::DidLoad));
        assert_eq!(rx_a.recv().await, Some(Event::DidTearDown));
        assert_eq!(rx_b.recv().await, Some(Event::DidLoad));
        assert_eq!(rx_b.recv().await, None); // channel closed by unsubscribe
    }
}
