// =============================================================================
// event_bus.rs — TYPED FAN-OUT FOR EVENT STREAM MESSAGES
// =============================================================================
//
// One broadcast channel per MessageKind plus a firehose that sees every
// message. Subscribers pick the kinds they care about and get typed
// `ServerMessage`s; there are no string event names for two components to
// collide on.
//
// Delivery is best effort: a subscriber that falls more than `capacity`
// messages behind skips ahead (tokio's `Lagged`), and nothing is buffered
// for subscribers that don't exist yet.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{MessageKind, ServerMessage};

pub struct EventBus {
    channels: HashMap<MessageKind, broadcast::Sender<ServerMessage>>,
    firehose: broadcast::Sender<ServerMessage>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let channels = MessageKind::ALL
            .into_iter()
            .map(|kind| (kind, broadcast::channel(capacity).0))
            .collect();
        let (firehose, _) = broadcast::channel(capacity);

        Self {
            channels,
            firehose,
            published: AtomicU64::new(0),
        }
    }

    /// Receive every future message of `kind`. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self, kind: MessageKind) -> broadcast::Receiver<ServerMessage> {
        self.sender(kind).subscribe()
    }

    /// Receive every future message regardless of kind.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ServerMessage> {
        self.firehose.subscribe()
    }

    /// Fan a message out to its kind's subscribers and the firehose.
    /// Returns how many receivers got it.
    pub fn publish(&self, message: ServerMessage) -> usize {
        let kind = message.kind();
        self.published.fetch_add(1, Ordering::Relaxed);

        // send() only fails when nobody is listening
        let direct = self.sender(kind).send(message.clone()).unwrap_or(0);
        let firehose = self.firehose.send(message).unwrap_or(0);

        if direct + firehose == 0 {
            debug!(kind = %kind, "Event published with no subscribers");
        }
        direct + firehose
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn sender(&self, kind: MessageKind) -> &broadcast::Sender<ServerMessage> {
        // Every kind is inserted in new(); the map is never mutated after.
        &self.channels[&kind]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_message(text: &str) -> ServerMessage {
        ServerMessage::Error {
            message: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_only_see_their_kind() {
        let bus = EventBus::new(16);
        let mut errors = bus.subscribe(MessageKind::Error);
        let mut models = bus.subscribe(MessageKind::ModelLoaded);

        bus.publish(error_message("boom"));
        bus.publish(ServerMessage::ModelLoaded {
            model: Some("parsbert".into()),
        });

        assert_eq!(errors.recv().await.unwrap(), error_message("boom"));
        assert!(errors.try_recv().is_err());
        assert_eq!(models.recv().await.unwrap().kind(), MessageKind::ModelLoaded);
    }

    #[tokio::test]
    async fn test_firehose_sees_everything() {
        let bus = EventBus::new(16);
        let mut all = bus.subscribe_all();

        bus.publish(error_message("one"));
        bus.publish(ServerMessage::ModelLoaded { model: None });

        assert_eq!(all.recv().await.unwrap().kind(), MessageKind::Error);
        assert_eq!(all.recv().await.unwrap().kind(), MessageKind::ModelLoaded);
        assert_eq!(bus.published_count(), 2);
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(error_message("nobody home")), 0);
    }

    #[test]
    fn test_dropping_receiver_unsubscribes() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe(MessageKind::Error);
        assert_eq!(bus.publish(error_message("seen")), 1);
        drop(rx);
        assert_eq!(bus.publish(error_message("unseen")), 0);
    }
}
