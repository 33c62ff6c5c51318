use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const RESOURCE_CHANNEL_CAPACITY: usize = 256;
const VENUE_CHANNEL_CAPACITY: usize = 4096;

/// Fan-out of committed events.
///
/// Per-resource channels back `LISTEN resource_{id}`; the venue-wide channel
/// feeds the award trigger. Events are published only after the WAL append
/// succeeded, so a subscriber never sees a change that was not committed.
pub struct NotifyHub {
    resources: DashMap<Ulid, broadcast::Sender<Event>>,
    venue: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            venue: broadcast::channel(VENUE_CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one resource. Creates the channel on first use.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        self.resources
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(RESOURCE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every event in the venue.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.venue.subscribe()
    }

    /// Publish a committed event. No-op for channels nobody listens on.
    pub fn send(&self, event: &Event) {
        if let Some(resource_id) = event.resource_id()
            && let Some(sender) = self.resources.get(&resource_id)
        {
            let _ = sender.send(event.clone());
        }
        let _ = self.venue.send(event.clone());
    }

    /// Drop a resource channel once its last listener is gone.
    pub fn prune(&self, resource_id: &Ulid) {
        self.resources
            .remove_if(resource_id, |_, sender| sender.receiver_count() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resource_subscriber_receives_own_events_only() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let other = Event::CounterSessionClosed { id: Ulid::new(), resource_id: Ulid::new() };
        let mine = Event::CounterSessionClosed { id: Ulid::new(), resource_id: rid };
        hub.send(&other);
        hub.send(&mine);

        assert_eq!(rx.recv().await.unwrap(), mine);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn venue_subscriber_sees_everything() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe_all();
        let a = Event::ResourceActivation { id: Ulid::new(), active: false };
        let b = Event::BalanceAdjusted {
            operation_id: Ulid::new(),
            customer_key: "k".into(),
            coins: 3,
            reason: "promo".into(),
            at: 0,
            actor: "staff".into(),
        };
        hub.send(&a);
        hub.send(&b);
        tokio_test::block_on(async {
            assert_eq!(tokio_test::assert_ok!(rx.recv().await), a);
            assert_eq!(tokio_test::assert_ok!(rx.recv().await), b);
        });
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::ResourceActivation { id: Ulid::new(), active: true });
    }

    #[tokio::test]
    async fn prune_keeps_channels_with_listeners() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let rx = hub.subscribe(rid);
        hub.prune(&rid);
        assert!(hub.resources.contains_key(&rid));
        drop(rx);
        hub.prune(&rid);
        assert!(!hub.resources.contains_key(&rid));
    }
}
