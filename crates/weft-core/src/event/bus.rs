//! Broadcast bus for distributing `CloudEvent`s to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op.

use tokio::sync::broadcast;
use weft_types::error::RepositoryError;
use weft_types::event::CloudEvent;

use crate::repository::CloudEventPublisher;

/// Multi-consumer bus for CloudEvents.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct CloudEventBus {
    sender: broadcast::Sender<CloudEvent>,
}

impl CloudEventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CloudEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: CloudEvent) {
        tracing::trace!(event_type = %event.type_, id = %event.id, "publishing on local bus");
        let _ = self.sender.send(event);
    }
}

impl CloudEventPublisher for CloudEventBus {
    async fn publish(&self, event: &CloudEvent) -> Result<(), RepositoryError> {
        CloudEventBus::publish(self, event.clone());
        Ok(())
    }
}

impl Clone for CloudEventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for CloudEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudEventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> CloudEvent {
        CloudEvent::new("urn:test", "order.placed")
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = CloudEventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.type_, "order.placed");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = CloudEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert_eq!(rx1.recv().await.unwrap().source, "urn:test");
        assert_eq!(rx2.recv().await.unwrap().source, "urn:test");
    }

    #[tokio::test]
    async fn publisher_impl_forwards_to_subscribers() {
        let bus = CloudEventBus::new(16);
        let mut rx = bus.subscribe();

        CloudEventPublisher::publish(&bus, &sample_event())
            .await
            .unwrap();

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = CloudEventBus::new(16);
        bus.publish(sample_event());
        bus.publish(sample_event());
    }

    #[test]
    fn clone_shares_channel() {
        let bus = CloudEventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event());

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn debug_impl() {
        let bus = CloudEventBus::new(16);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("CloudEventBus"));
        assert!(debug.contains("receiver_count"));
    }
}
