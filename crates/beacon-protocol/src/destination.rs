//! Destination namespaces.
//!
//! - `/topic/..` and `/queue/..` are broker destinations (broadcast)
//! - `/app/..` are application destinations handled by the server
//! - `/user/..` are private destinations resolved per principal

use crate::codec::ProtocolError;

pub const TOPIC_PREFIX: &str = "/topic";
pub const QUEUE_PREFIX: &str = "/queue";
pub const APP_PREFIX: &str = "/app";
pub const USER_PREFIX: &str = "/user";

/// A classified destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Broker destination, holding the full path (`/topic/tickets/7`).
    Broker(String),
    /// Application destination, holding the path after `/app`.
    Application(String),
    /// Per-user destination, holding the path after `/user`
    /// (`/queue/notifications`).
    User(String),
}

impl Destination {
    /// Classify a destination header value.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidDestination` if the value is outside
    /// every known prefix or a per-user destination does not name a
    /// broker destination.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if has_prefix(raw, TOPIC_PREFIX) || has_prefix(raw, QUEUE_PREFIX) {
            return Ok(Destination::Broker(raw.to_string()));
        }
        if let Some(rest) = strip(raw, APP_PREFIX) {
            return Ok(Destination::Application(rest.to_string()));
        }
        if let Some(rest) = strip(raw, USER_PREFIX) {
            if has_prefix(rest, TOPIC_PREFIX) || has_prefix(rest, QUEUE_PREFIX) {
                return Ok(Destination::User(rest.to_string()));
            }
        }
        Err(ProtocolError::InvalidDestination(raw.to_string()))
    }

    /// The destination as a client addresses it.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Destination::Broker(path) => path.clone(),
            Destination::Application(path) => format!("{APP_PREFIX}{path}"),
            Destination::User(path) => user_destination(path),
        }
    }
}

/// Build the client-facing form of a per-user destination.
#[must_use]
pub fn user_destination(path: &str) -> String {
    format!("{USER_PREFIX}{path}")
}

fn has_prefix(raw: &str, prefix: &str) -> bool {
    strip(raw, prefix).is_some()
}

/// Strip `prefix` only at a segment boundary, keeping the leading `/`.
fn strip<'a>(raw: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = raw.strip_prefix(prefix)?;
    if rest.len() > 1 && rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            Destination::parse("/topic/tickets/7").unwrap(),
            Destination::Broker("/topic/tickets/7".into())
        );
        assert_eq!(
            Destination::parse("/queue/notifications").unwrap(),
            Destination::Broker("/queue/notifications".into())
        );
        assert_eq!(
            Destination::parse("/app/presence/heartbeat").unwrap(),
            Destination::Application("/presence/heartbeat".into())
        );
        assert_eq!(
            Destination::parse("/user/queue/notifications").unwrap(),
            Destination::User("/queue/notifications".into())
        );
    }

    #[test]
    fn test_prefix_must_end_at_segment() {
        assert!(Destination::parse("/topics/x").is_err());
        assert!(Destination::parse("/topic").is_err());
        assert!(Destination::parse("/topic/").is_err());
        assert!(Destination::parse("/user/app/x").is_err());
        assert!(Destination::parse("chat").is_err());
    }

    #[test]
    fn test_to_wire() {
        let dest = Destination::parse("/user/queue/notifications").unwrap();
        assert_eq!(dest.to_wire(), "/user/queue/notifications");
        assert_eq!(user_destination("/queue/a"), "/user/queue/a");
    }
}
