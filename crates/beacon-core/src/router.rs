//! Message router for Beacon.
//!
//! The router owns topic channels and the per-session delivery queues.
//! Topic broadcasts go through each channel's `broadcast` sender; directed
//! deliveries are pushed onto the queues of the target user's live
//! sessions as reported by the [`PresenceTracker`].
//!
//! Locks are always taken sessions-then-channels and no map guard is held
//! across an `.await`.

use crate::channel::{validate_channel_name, Channel, ChannelId};
use crate::event::{DeliveryEvent, EventBus};
use crate::message::{Delivery, Message};
use crate::presence::PresenceTracker;
use crate::session::SessionId;
use beacon_protocol::destination::user_destination;
use beacon_protocol::Destination;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Destination cannot be subscribed to.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Not subscribed to destination.
    #[error("Not subscribed to destination: {0}")]
    NotSubscribed(String),

    /// Already subscribed to destination.
    #[error("Already subscribed to destination: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum channels reached.
    #[error("Maximum channels reached")]
    MaxChannelsReached,

    /// Session was never registered or already removed.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Session is already registered.
    #[error("Session already registered: {0}")]
    SessionExists(String),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Channel broadcast capacity.
    pub channel_capacity: usize,
    /// Capacity of each session's directed delivery queue.
    pub session_queue_capacity: usize,
    /// Whether to auto-delete empty channels.
    pub auto_delete_empty_channels: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
            max_subscriptions_per_connection: 100,
            channel_capacity: 1024,
            session_queue_capacity: 256,
            auto_delete_empty_channels: true,
        }
    }
}

/// Result of a successful subscribe.
#[derive(Debug)]
pub enum Subscription {
    /// Broker destination; messages arrive on this receiver.
    Topic(broadcast::Receiver<Arc<Message>>),
    /// Per-user destination; messages arrive on the session's queue.
    User,
}

struct SessionRoute {
    sink: mpsc::Sender<Delivery>,
    topics: HashSet<ChannelId>,
    user_destinations: HashSet<String>,
}

impl SessionRoute {
    fn subscription_count(&self) -> usize {
        self.topics.len() + self.user_destinations.len()
    }
}

/// The central message router.
pub struct Router {
    /// Channels indexed by name.
    channels: DashMap<ChannelId, Channel>,
    /// Registered sessions.
    sessions: DashMap<SessionId, SessionRoute>,
    presence: Arc<PresenceTracker>,
    events: EventBus,
    config: RouterConfig,
}

impl Router {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(presence: Arc<PresenceTracker>) -> Self {
        Self::with_config(presence, RouterConfig::default())
    }

    /// Create a router with custom configuration. Routing events go onto
    /// the tracker's event bus.
    #[must_use]
    pub fn with_config(presence: Arc<PresenceTracker>, config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            sessions: DashMap::new(),
            events: presence.events().clone(),
            presence,
            config,
        }
    }

    /// The presence tracker directed delivery resolves users through.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// The bus routing and presence events are emitted on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Create a delivery queue sized from the configuration.
    #[must_use]
    pub fn session_queue(&self) -> (mpsc::Sender<Delivery>, mpsc::Receiver<Delivery>) {
        mpsc::channel(self.config.session_queue_capacity.max(1))
    }

    /// Register a session and the queue its directed deliveries go to.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::SessionExists` if the id is already registered.
    pub fn register_session(
        &self,
        session_id: &SessionId,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<(), RouterError> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(RouterError::SessionExists(session_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(SessionRoute {
                    sink,
                    topics: HashSet::new(),
                    user_destinations: HashSet::new(),
                });
                debug!(session = %session_id, "Session registered");
                Ok(())
            }
        }
    }

    /// Subscribe a session to a destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown, the destination is not
    /// subscribable, is already subscribed, or a limit is exceeded.
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        destination: &Destination,
    ) -> Result<Subscription, RouterError> {
        let mut route = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RouterError::UnknownSession(session_id.to_string()))?;

        if route.subscription_count() >= self.config.max_subscriptions_per_connection {
            return Err(RouterError::MaxSubscriptionsReached);
        }

        match destination {
            Destination::Broker(name) => {
                validate_channel_name(name).map_err(RouterError::InvalidChannel)?;
                if route.topics.contains(name) {
                    return Err(RouterError::AlreadySubscribed(name.clone()));
                }
                if !self.channels.contains_key(name)
                    && self.channels.len() >= self.config.max_channels
                {
                    return Err(RouterError::MaxChannelsReached);
                }

                let mut channel = self.channels.entry(name.clone()).or_insert_with(|| {
                    debug!(channel = %name, "Creating new channel");
                    Channel::with_capacity(name.clone(), self.config.channel_capacity)
                });
                let receiver = channel.subscribe(session_id);
                route.topics.insert(name.clone());

                debug!(
                    channel = %name,
                    session = %session_id,
                    subscribers = channel.subscriber_count(),
                    "Subscribed"
                );
                Ok(Subscription::Topic(receiver))
            }
            Destination::User(path) => {
                if !route.user_destinations.insert(path.clone()) {
                    return Err(RouterError::AlreadySubscribed(destination.to_wire()));
                }
                debug!(destination = %path, session = %session_id, "Subscribed to user destination");
                Ok(Subscription::User)
            }
            Destination::Application(_) => {
                Err(RouterError::InvalidDestination(destination.to_wire()))
            }
        }
    }

    /// Unsubscribe a session from a destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or not subscribed.
    pub fn unsubscribe(
        &self,
        session_id: &SessionId,
        destination: &Destination,
    ) -> Result<(), RouterError> {
        let mut route = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RouterError::UnknownSession(session_id.to_string()))?;

        match destination {
            Destination::Broker(name) => {
                if !route.topics.remove(name) {
                    return Err(RouterError::NotSubscribed(name.clone()));
                }
                self.leave_channel(session_id, name);
                Ok(())
            }
            Destination::User(path) => {
                if !route.user_destinations.remove(path) {
                    return Err(RouterError::NotSubscribed(destination.to_wire()));
                }
                Ok(())
            }
            Destination::Application(_) => Err(RouterError::NotSubscribed(destination.to_wire())),
        }
    }

    /// Drop a session and all of its subscriptions.
    ///
    /// Returns `false` if the session was not registered.
    pub fn remove_session(&self, session_id: &SessionId) -> bool {
        let Some((_, route)) = self.sessions.remove(session_id) else {
            return false;
        };

        for name in &route.topics {
            self.leave_channel(session_id, name);
        }

        debug!(session = %session_id, "Session removed from router");
        true
    }

    fn leave_channel(&self, session_id: &SessionId, name: &str) {
        if let Some(mut channel) = self.channels.get_mut(name) {
            channel.unsubscribe(session_id);
            debug!(
                channel = %name,
                session = %session_id,
                subscribers = channel.subscriber_count(),
                "Unsubscribed"
            );
        }

        if self.config.auto_delete_empty_channels
            && self
                .channels
                .remove_if(name, |_, channel| channel.is_empty())
                .is_some()
        {
            debug!(channel = %name, "Deleted empty channel");
        }
    }

    /// Publish a message to its destination topic.
    ///
    /// Returns the number of subscribers that received the message.
    pub fn publish(&self, message: Message) -> usize {
        let message = Arc::new(message);
        let topic = message.destination.clone();

        let recipients = match self.channels.get(&topic) {
            Some(channel) => channel.publish(message.clone()),
            None => 0,
        };
        trace!(channel = %topic, recipients, "Published message");

        self.events.emit(DeliveryEvent::Broadcast {
            topic,
            message,
            recipients,
        });
        recipients
    }

    /// Publish a raw payload to a topic.
    pub fn broadcast(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.publish(Message::new(topic, payload))
    }

    /// Deliver a message to every live session of `user_id` subscribed to
    /// `/user{message.destination}`.
    ///
    /// Users without live sessions are skipped silently. Returns the number
    /// of sessions the message was queued for.
    pub fn send_to_user(&self, user_id: &str, message: Message) -> usize {
        let sessions = self.presence.live_sessions(user_id);
        if sessions.is_empty() {
            trace!(user = %user_id, "User offline, dropping directed message");
            return 0;
        }

        let message = Arc::new(message);
        let destination = user_destination(&message.destination);
        let mut recipients = 0;

        for session_id in &sessions {
            let Some(route) = self.sessions.get(session_id) else {
                continue;
            };
            if !route.user_destinations.contains(&message.destination) {
                continue;
            }
            match route
                .sink
                .try_send(Delivery::new(destination.clone(), message.clone()))
            {
                Ok(()) => recipients += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session = %session_id, user = %user_id, "Delivery queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session = %session_id, "Delivery queue closed");
                }
            }
        }

        trace!(user = %user_id, destination = %destination, recipients, "Directed message");
        self.events.emit(DeliveryEvent::Directed {
            user_id: user_id.to_string(),
            message,
            recipients,
        });
        recipients
    }

    /// Deliver a raw payload to a user's sessions.
    pub fn send_payload_to_user(
        &self,
        user_id: &str,
        destination: &str,
        payload: impl Into<Bytes>,
    ) -> usize {
        self.send_to_user(user_id, Message::new(destination, payload))
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_name: &str) -> usize {
        self.channels
            .get(channel_name)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Get all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Destinations a session is subscribed to, as clients address them.
    #[must_use]
    pub fn session_subscriptions(&self, session_id: &SessionId) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|route| {
                route
                    .topics
                    .iter()
                    .cloned()
                    .chain(route.user_destinations.iter().map(|p| user_destination(p)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            channel_count: self.channels.len(),
            session_count: self.sessions.len(),
            total_subscriptions: self.sessions.iter().map(|s| s.subscription_count()).sum(),
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of registered sessions.
    pub session_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn router() -> Router {
        Router::new(Arc::new(PresenceTracker::new(Duration::from_secs(60))))
    }

    fn session(router: &Router, id: &str) -> (SessionId, mpsc::Receiver<Delivery>) {
        let id = SessionId::new(id);
        let (tx, rx) = router.session_queue();
        router.register_session(&id, tx).unwrap();
        (id, rx)
    }

    fn dest(raw: &str) -> Destination {
        Destination::parse(raw).unwrap()
    }

    fn topic(sub: Subscription) -> broadcast::Receiver<Arc<Message>> {
        match sub {
            Subscription::Topic(rx) => rx,
            Subscription::User => panic!("expected topic subscription"),
        }
    }

    #[test]
    fn test_router_subscribe_unsubscribe() {
        let router = router();
        let (s1, _q) = session(&router, "s1");

        let rx = router.subscribe(&s1, &dest("/topic/tickets/1")).unwrap();
        assert!(router.channel_exists("/topic/tickets/1"));
        assert_eq!(router.subscriber_count("/topic/tickets/1"), 1);
        drop(rx);

        router.unsubscribe(&s1, &dest("/topic/tickets/1")).unwrap();
        // Channel should be auto-deleted
        assert!(!router.channel_exists("/topic/tickets/1"));
        assert!(matches!(
            router.unsubscribe(&s1, &dest("/topic/tickets/1")),
            Err(RouterError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_broadcast_reaches_each_subscriber_once() {
        let router = router();
        let mut receivers: Vec<_> = (0..3)
            .map(|i| {
                let (id, _q) = session(&router, &format!("s{i}"));
                topic(router.subscribe(&id, &dest("/topic/tickets/7")).unwrap())
            })
            .collect();

        assert_eq!(router.broadcast("/topic/tickets/7", b"update".to_vec()), 3);

        let (late, _q) = session(&router, "late");
        let mut late_rx = topic(router.subscribe(&late, &dest("/topic/tickets/7")).unwrap());

        for rx in &mut receivers {
            assert_eq!(&rx.try_recv().unwrap().payload[..], b"update");
            assert!(rx.try_recv().is_err());
        }
        assert!(late_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_without_channel() {
        let router = router();
        assert_eq!(router.broadcast("/topic/nobody", b"x".to_vec()), 0);
        assert!(!router.channel_exists("/topic/nobody"));
    }

    #[tokio::test]
    async fn test_send_to_user_live_session() {
        let router = router();
        let (s1, mut q1) = session(&router, "s1");
        router.presence().mark_online("u1", &s1);
        router.subscribe(&s1, &dest("/user/queue/notifications")).unwrap();

        let sent = router.send_payload_to_user("u1", "/queue/notifications", b"hi".to_vec());
        assert_eq!(sent, 1);

        let delivery = q1.recv().await.unwrap();
        assert_eq!(delivery.destination, "/user/queue/notifications");
        assert_eq!(&delivery.message.payload[..], b"hi");
        assert!(q1.try_recv().is_err());
    }

    #[test]
    fn test_send_to_offline_user_is_noop() {
        let router = router();
        let mut events = router.events().subscribe();
        assert_eq!(router.send_payload_to_user("ghost", "/queue/notifications", b"x".to_vec()), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_send_to_user_skips_other_users_and_unsubscribed() {
        let router = router();
        let (s1, mut q1) = session(&router, "s1");
        let (s2, mut q2) = session(&router, "s2");
        let (s3, mut q3) = session(&router, "s3");
        router.presence().mark_online("u1", &s1);
        router.presence().mark_online("u1", &s2);
        router.presence().mark_online("u2", &s3);
        router.subscribe(&s1, &dest("/user/queue/notifications")).unwrap();
        router.subscribe(&s3, &dest("/user/queue/notifications")).unwrap();

        assert_eq!(router.send_payload_to_user("u1", "/queue/notifications", b"x".to_vec()), 1);
        assert!(q1.try_recv().is_ok());
        assert!(q2.try_recv().is_err());
        assert!(q3.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops() {
        let presence = Arc::new(PresenceTracker::new(Duration::from_secs(60)));
        let router = Router::with_config(
            presence,
            RouterConfig {
                session_queue_capacity: 1,
                ..RouterConfig::default()
            },
        );
        let (s1, _q1) = session(&router, "s1");
        router.presence().mark_online("u1", &s1);
        router.subscribe(&s1, &dest("/user/queue/a")).unwrap();

        assert_eq!(router.send_payload_to_user("u1", "/queue/a", b"1".to_vec()), 1);
        assert_eq!(router.send_payload_to_user("u1", "/queue/a", b"2".to_vec()), 0);
    }

    #[test]
    fn test_router_invalid_destinations() {
        let router = router();
        let (s1, _q) = session(&router, "s1");

        assert!(matches!(
            router.subscribe(&s1, &dest("/app/presence/heartbeat")),
            Err(RouterError::InvalidDestination(_))
        ));
        assert!(matches!(
            router.subscribe(&SessionId::new("nope"), &dest("/topic/a")),
            Err(RouterError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_router_already_subscribed() {
        let router = router();
        let (s1, _q) = session(&router, "s1");

        let _rx = router.subscribe(&s1, &dest("/topic/a")).unwrap();
        assert!(matches!(
            router.subscribe(&s1, &dest("/topic/a")),
            Err(RouterError::AlreadySubscribed(_))
        ));
        router.subscribe(&s1, &dest("/user/queue/a")).unwrap();
        assert!(matches!(
            router.subscribe(&s1, &dest("/user/queue/a")),
            Err(RouterError::AlreadySubscribed(_))
        ));
    }

    #[test]
    fn test_limits() {
        let presence = Arc::new(PresenceTracker::new(Duration::from_secs(60)));
        let router = Router::with_config(
            presence,
            RouterConfig {
                max_channels: 1,
                max_subscriptions_per_connection: 2,
                ..RouterConfig::default()
            },
        );
        let (s1, _q) = session(&router, "s1");

        let _rx = router.subscribe(&s1, &dest("/topic/a")).unwrap();
        assert!(matches!(
            router.subscribe(&s1, &dest("/topic/b")),
            Err(RouterError::MaxChannelsReached)
        ));
        router.subscribe(&s1, &dest("/user/queue/a")).unwrap();
        assert!(matches!(
            router.subscribe(&s1, &dest("/user/queue/b")),
            Err(RouterError::MaxSubscriptionsReached)
        ));
    }

    #[test]
    fn test_register_twice() {
        let router = router();
        let (s1, _q) = session(&router, "s1");
        let (tx, _rx) = router.session_queue();
        assert!(matches!(
            router.register_session(&s1, tx),
            Err(RouterError::SessionExists(_))
        ));
    }

    #[test]
    fn test_remove_session() {
        let router = router();
        let (s1, _q1) = session(&router, "s1");
        let (s2, _q2) = session(&router, "s2");

        let _rx1 = router.subscribe(&s1, &dest("/topic/a")).unwrap();
        let _rx2 = router.subscribe(&s1, &dest("/topic/b")).unwrap();
        let _rx3 = router.subscribe(&s2, &dest("/topic/a")).unwrap();
        router.subscribe(&s1, &dest("/user/queue/n")).unwrap();

        let stats = router.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.session_count, 2);
        assert_eq!(stats.total_subscriptions, 4);

        let mut subs = router.session_subscriptions(&s1);
        subs.sort();
        assert_eq!(subs, vec!["/topic/a", "/topic/b", "/user/queue/n"]);

        assert!(router.remove_session(&s1));
        assert!(!router.remove_session(&s1));
        assert!(router.channel_exists("/topic/a"));
        assert!(!router.channel_exists("/topic/b"));
        assert_eq!(router.subscriber_count("/topic/a"), 1);
    }
}
