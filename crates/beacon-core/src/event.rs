//! Delivery events emitted by presence tracking and routing.

use crate::message::Message;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default event bus capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something observable happened in the presence or routing layer.
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// A user went from zero live sessions to at least one.
    Online {
        /// The user that came online.
        user_id: String,
    },
    /// A user's last live session went away, by disconnect or by expiry.
    Offline {
        /// The user that went offline.
        user_id: String,
    },
    /// A message was published to a topic.
    Broadcast {
        /// Topic key.
        topic: String,
        /// The published message.
        message: Arc<Message>,
        /// Number of subscribers reached.
        recipients: usize,
    },
    /// A message was delivered to one user's sessions.
    Directed {
        /// Target user.
        user_id: String,
        /// The delivered message.
        message: Arc<Message>,
        /// Number of sessions reached.
        recipients: usize,
    },
}

impl DeliveryEvent {
    /// Short name of the event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryEvent::Online { .. } => "ONLINE",
            DeliveryEvent::Offline { .. } => "OFFLINE",
            DeliveryEvent::Broadcast { .. } => "BROADCAST",
            DeliveryEvent::Directed { .. } => "DIRECTED",
        }
    }
}

/// Fan-out channel for [`DeliveryEvent`]s.
///
/// Cloning the bus shares the underlying channel. Events are dropped
/// when nobody is subscribed, and a receiver that falls more than the
/// capacity behind observes `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeliveryEvent>,
}

impl EventBus {
    /// Create an event bus holding up to `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Returns the number of receivers it reached.
    pub fn emit(&self, event: DeliveryEvent) -> usize {
        trace!(kind = event.kind(), "Emitting delivery event");
        self.sender.send(event).unwrap_or_default()
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_receivers() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(DeliveryEvent::Online { user_id: "u1".into() }), 0);
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(DeliveryEvent::Offline { user_id: "u1".into() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "OFFLINE");
        assert!(matches!(event, DeliveryEvent::Offline { user_id } if user_id == "u1"));
    }
}
