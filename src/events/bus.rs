//! # Container event bus.
//!
//! Every lifecycle edge a controller takes, every transaction outcome and every
//! subscriber fault is published here as an [`Event`]. The container forwards
//! the stream to its [`SubscriberSet`](crate::SubscriberSet); callers can also
//! tap it directly through `ServiceContainer::events()`.
//!
//! ```text
//!   ServiceController ──┐ ServiceInstalled / ServiceTransition / StartFailed ...
//!   Transaction ────────┼──► Bus ──┬──► container listener ──► SubscriberSet
//!   SubscriberSet ──────┘          └──► ServiceContainer::events() receivers
//!                        SubscriberOverflow / SubscriberPanicked
//! ```
//!
//! Publishing never waits. The channel keeps the last `capacity` events; a
//! receiver that falls further behind sees `RecvError::Lagged(n)`. Events sent
//! while nobody listens are gone.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for container events. Clones share the same channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// A bus retaining up to `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Event>(capacity);
        Self { tx }
    }

    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// A receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live receivers, the container listener included.
    pub fn receivers(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn receivers_observe_events_published_after_subscribing() {
        let bus = Bus::new(0);
        bus.publish(Event::new(EventKind::TransactionCommitted));

        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::TransactionRolledBack));

        let ev = rx.recv().await.expect("event");
        assert_eq!(ev.kind, EventKind::TransactionRolledBack);
        assert_eq!(bus.receivers(), 1);
    }

    #[tokio::test]
    async fn slow_receivers_lag_behind_the_ring() {
        let bus = Bus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..3 {
            bus.publish(Event::new(EventKind::ServiceTransition));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
    }
}
