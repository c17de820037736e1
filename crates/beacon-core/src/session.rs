//! Per-connection session state.
//!
//! A session moves through `Unauthenticated -> Authenticated -> Active ->
//! Closed`. [`Session::close`] is the only way into `Closed` and runs the
//! presence offline path at most once.

use crate::auth::Principal;
use crate::presence::PresenceTracker;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of one physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an identifier that is not reused for the life of the
    /// process.
    #[must_use]
    pub fn generate() -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{started:x}-{seq:x}"))
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No principal attached yet.
    Unauthenticated,
    /// A principal is attached but no frame has been processed for it.
    Authenticated,
    /// Receiving frames and refreshing presence.
    Active,
    /// Terminal.
    Closed,
}

/// One connection's identity and state.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    principal: Option<Principal>,
    state: SessionState,
}

impl Session {
    /// Create an unauthenticated session.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            principal: None,
            state: SessionState::Unauthenticated,
        }
    }

    /// Create a session whose principal was established at the handshake.
    #[must_use]
    pub fn with_principal(id: SessionId, principal: Principal) -> Self {
        Self {
            id,
            principal: Some(principal),
            state: SessionState::Authenticated,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The attached principal, if any.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Attach a principal. A session belongs to one principal for its
    /// lifetime, so this is a no-op when one is already attached or the
    /// session is closed. Returns whether the principal was attached.
    pub fn attach_principal(&mut self, principal: Principal) -> bool {
        if self.principal.is_some() || self.is_closed() {
            return false;
        }
        debug!(session = %self.id, user = %principal, "Principal attached");
        self.principal = Some(principal);
        self.state = SessionState::Authenticated;
        true
    }

    /// Mark the session active. Only authenticated sessions become active.
    pub fn activate(&mut self) {
        if self.state == SessionState::Authenticated {
            self.state = SessionState::Active;
        }
    }

    /// Close the session and remove it from presence.
    ///
    /// Idempotent: only the first call touches the tracker. Returns `true`
    /// if this call performed the close.
    pub fn close(&mut self, presence: &PresenceTracker) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closed;
        if let Some(principal) = &self.principal {
            presence.mark_offline_if_no_sessions(principal.name(), &self.id);
        }
        debug!(session = %self.id, "Session closed");
        true
    }
}
