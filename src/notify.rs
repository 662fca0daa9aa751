use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, OwnerId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub carrying each owner's committed writes.
pub struct NotifyHub {
    channels: DashMap<OwnerId, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to an owner's feed. Creates the channel if needed.
    pub fn subscribe(&self, owner_id: OwnerId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, owner_id: OwnerId, event: &Event) {
        if let Some(sender) = self.channels.get(&owner_id) {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(owner_id: OwnerId) -> Event {
        Event::ServiceRegistered {
            id: 1,
            owner_id,
            name: "haircut".into(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(3);
        hub.send(3, &registered(3));
        assert_eq!(rx.recv().await.unwrap(), registered(3));
    }

    #[tokio::test]
    async fn feeds_are_per_owner() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(3);
        hub.send(4, &registered(4));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(9, &registered(9));
    }
}
