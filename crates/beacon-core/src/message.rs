//! Routed message types for Beacon.
//!
//! A [`Message`] is what producers hand to the router; a [`Delivery`] is
//! one copy of it queued for a single session.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON content type attached by [`Message::json`].
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = unix_nanos();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// A message for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Topic for broadcasts, or the per-user path (`/queue/notifications`)
    /// for directed delivery.
    pub destination: String,
    /// Optional MIME type of the payload.
    pub content_type: Option<String>,
    /// Message payload.
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch when the message was created.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            destination: destination.into(),
            content_type: None,
            payload: payload.into(),
            timestamp: unix_nanos() / 1_000_000,
        }
    }

    /// Create a message with a JSON-serialized payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn json<T: Serialize>(
        destination: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(destination, payload).with_content_type(JSON_CONTENT_TYPE))
    }

    /// Set the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// A message queued for one session.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Destination as the session subscribed to it (`/topic/..` or
    /// `/user/queue/..`).
    pub destination: String,
    /// The message to deliver.
    pub message: Arc<Message>,
}

impl Delivery {
    /// Create a new delivery.
    #[must_use]
    pub fn new(destination: impl Into<String>, message: Arc<Message>) -> Self {
        Self {
            destination: destination.into(),
            message,
        }
    }
}
