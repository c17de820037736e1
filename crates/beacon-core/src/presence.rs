//! Presence tracking for Beacon.
//!
//! A user is online while at least one of its sessions holds an unexpired
//! lease. Each user's sessions live in one `DashMap` entry, and every
//! "first session in" / "last session out" decision is made and emitted
//! while that entry is locked, so concurrent connects and disconnects for
//! the same user cannot lose or duplicate a transition. Different users
//! only contend when they hash to the same shard.
//!
//! An entry exists exactly while the last event emitted for its user was
//! `Online`.

use crate::event::{DeliveryEvent, EventBus};
use crate::session::SessionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Default session lease.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(60);

/// Liveness of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLease {
    /// Last time the session was marked online or refreshed.
    pub last_seen: Instant,
    /// When the session stops counting as live.
    pub expires_at: Instant,
}

impl SessionLease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct UserPresence {
    sessions: HashMap<SessionId, SessionLease>,
}

impl UserPresence {
    /// Drop expired sessions. Returns how many were dropped.
    fn prune(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, lease| lease.is_live(now));
        before - self.sessions.len()
    }

    fn live(&self, now: Instant) -> impl Iterator<Item = &SessionId> {
        self.sessions
            .iter()
            .filter(move |(_, lease)| lease.is_live(now))
            .map(|(id, _)| id)
    }
}

/// Tracks which users are online across all of their sessions.
#[derive(Debug)]
pub struct PresenceTracker {
    users: DashMap<String, UserPresence>,
    ttl: Duration,
    events: EventBus,
}

impl PresenceTracker {
    /// Create a tracker with its own event bus.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_events(ttl, EventBus::default())
    }

    /// Create a tracker that emits onto `events`.
    #[must_use]
    pub fn with_events(ttl: Duration, events: EventBus) -> Self {
        Self {
            users: DashMap::new(),
            ttl,
            events,
        }
    }

    /// Session lease length.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The bus ONLINE and OFFLINE events are emitted on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Add or refresh a session.
    ///
    /// Returns `true` if the user went from no live sessions to one, in
    /// which case exactly one `Online` event was emitted.
    pub fn mark_online(&self, user_id: &str, session_id: &SessionId) -> bool {
        self.upsert(user_id, session_id)
    }

    /// Extend a session's lease, adding the session if it is not tracked
    /// yet. Emits `Online` only if the user had no live session.
    pub fn refresh(&self, user_id: &str, session_id: &SessionId) -> bool {
        self.upsert(user_id, session_id)
    }

    fn upsert(&self, user_id: &str, session_id: &SessionId) -> bool {
        if user_id.trim().is_empty() {
            return false;
        }

        let now = Instant::now();
        let lease = SessionLease {
            last_seen: now,
            expires_at: now + self.ttl,
        };

        let mut presence = self.users.entry(user_id.to_string()).or_default();

        let tracked = !presence.sessions.is_empty();
        presence.prune(now);
        if tracked && presence.sessions.is_empty() {
            // Every lease lapsed before the sweeper saw it.
            self.emit_offline(user_id);
        }

        let came_online = presence.sessions.is_empty();
        presence.sessions.insert(session_id.clone(), lease);
        if came_online {
            info!(user = %user_id, session = %session_id, "User online");
            self.events.emit(DeliveryEvent::Online {
                user_id: user_id.to_string(),
            });
        }
        came_online
    }

    /// Remove a session. If it was the user's last live session the user
    /// goes offline and exactly one `Offline` event is emitted.
    ///
    /// Returns `true` if the user went offline.
    pub fn mark_offline_if_no_sessions(&self, user_id: &str, session_id: &SessionId) -> bool {
        let Entry::Occupied(mut entry) = self.users.entry(user_id.to_string()) else {
            return false;
        };

        let presence = entry.get_mut();
        presence.sessions.remove(session_id);
        presence.prune(Instant::now());

        if presence.sessions.is_empty() {
            self.emit_offline(user_id);
            entry.remove();
            true
        } else {
            debug!(
                user = %user_id,
                session = %session_id,
                remaining = presence.sessions.len(),
                "Session left, user still online"
            );
            false
        }
    }

    /// Remove every expired session, taking users whose last session
    /// expired offline through the same path as an explicit disconnect.
    ///
    /// Returns the number of users that went offline.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut offline = 0;

        self.users.retain(|user_id, presence| {
            let expired = presence.prune(now);
            if expired > 0 {
                debug!(user = %user_id, expired, "Expired sessions");
            }
            if presence.sessions.is_empty() {
                self.emit_offline(user_id);
                offline += 1;
                false
            } else {
                true
            }
        });

        offline
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// the tracker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                let offline = tracker.sweep_expired();
                if offline > 0 {
                    debug!(offline, "Presence sweep");
                }
            }
        })
    }

    /// Whether the user has a live session.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        let now = Instant::now();
        self.users
            .get(user_id)
            .map(|presence| presence.live(now).next().is_some())
            .unwrap_or(false)
    }

    /// The user's live sessions.
    #[must_use]
    pub fn live_sessions(&self, user_id: &str) -> Vec<SessionId> {
        let now = Instant::now();
        self.users
            .get(user_id)
            .map(|presence| presence.live(now).cloned().collect())
            .unwrap_or_default()
    }

    /// Lease of one session, if tracked.
    #[must_use]
    pub fn session_lease(&self, user_id: &str, session_id: &SessionId) -> Option<SessionLease> {
        self.users
            .get(user_id)
            .and_then(|presence| presence.sessions.get(session_id).copied())
    }

    /// Number of users with a live session.
    #[must_use]
    pub fn online_user_count(&self) -> usize {
        let now = Instant::now();
        self.users
            .iter()
            .filter(|entry| entry.live(now).next().is_some())
            .count()
    }

    /// Number of live sessions across all users.
    #[must_use]
    pub fn online_session_count(&self) -> usize {
        let now = Instant::now();
        self.users.iter().map(|entry| entry.live(now).count()).sum()
    }

    fn emit_offline(&self, user_id: &str) {
        info!(user = %user_id, "User offline");
        self.events.emit(DeliveryEvent::Offline {
            user_id: user_id.to_string(),
        });
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}
