//! Topic channels for Beacon.
//!
//! A channel is a broker destination (`/topic/..` or `/queue/..`) that
//! sessions subscribe to for broadcast delivery.

use crate::message::Message;
use crate::session::SessionId;
use beacon_protocol::Destination;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err("Channel name contains invalid characters");
    }
    match Destination::parse(name) {
        Ok(Destination::Broker(_)) => Ok(()),
        _ => Err("Channel name must be under /topic or /queue"),
    }
}

/// A topic channel.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    /// Broadcast sender for this channel.
    sender: broadcast::Sender<Arc<Message>>,
    /// Subscribed sessions.
    subscribers: HashSet<SessionId>,
    /// Channel capacity.
    capacity: usize,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new channel with a specific capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<ChannelId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
            subscribers: HashSet::new(),
            capacity,
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a session is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, session_id: &SessionId) -> bool {
        self.subscribers.contains(session_id)
    }

    /// Subscribe a session to this channel.
    ///
    /// The receiver only sees messages published after this call.
    pub fn subscribe(&mut self, session_id: &SessionId) -> broadcast::Receiver<Arc<Message>> {
        self.subscribers.insert(session_id.clone());
        debug!(channel = %self.name, session = %session_id, "Session subscribed");
        self.sender.subscribe()
    }

    /// Unsubscribe a session from this channel.
    ///
    /// Returns `true` if the session was subscribed.
    pub fn unsubscribe(&mut self, session_id: &SessionId) -> bool {
        let removed = self.subscribers.remove(session_id);
        if removed {
            debug!(channel = %self.name, session = %session_id, "Session unsubscribed");
        }
        removed
    }

    /// Publish a message to this channel.
    ///
    /// Returns the number of receivers that received the message.
    pub fn publish(&self, message: Arc<Message>) -> usize {
        trace!(channel = %self.name, id = message.id, "Publishing message");
        self.sender.send(message).unwrap_or_default()
    }

    /// Publish raw payload to this channel.
    pub fn publish_payload(&self, payload: impl Into<Bytes>) -> usize {
        self.publish(Arc::new(Message::new(self.name.clone(), payload)))
    }

    /// Check if the channel is empty (no subscribers).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
