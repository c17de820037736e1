//! Transport abstraction traits for Beacon.
//!
//! Both the persistent socket and the polling fallback implement
//! [`Connection`], so the server drives every client with the same loop.

use async_trait::async_trait;
use beacon_protocol::Frame;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one client connection for its whole lifetime.
///
/// The server reuses it as the session id. Polling clients present this id on every request, so it must not be
/// guessable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, `conn_` followed by 32 hex digits.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors raised while moving frames over a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away, or the connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// No polling session with this id.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound bytes did not decode to a frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] beacon_protocol::ProtocolError),
}

/// One client's frame stream, independent of how it is carried.
///
/// `recv` must be cancel safe: the server
/// drops a pending `recv` whenever another event wins a `select!`.
#[async_trait]
pub trait Connection: Send {
    fn id(&self) -> &ConnectionId;

    /// Name of the transport ("websocket", "polling").
    fn transport(&self) -> &'static str;

    /// Next inbound frame, or `None` once the client has gone away cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Encode and send one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send an already encoded frame.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close from the server side. Further sends fail.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Peer address, when the transport knows it.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// `false` after `close` or once the peer has gone away.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let first = ConnectionId::generate();
        let second = ConnectionId::generate();
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("conn_"));
        assert_eq!(first.as_str().len(), "conn_".len() + 32);
    }

    #[test]
    fn ids_convert_from_strings() {
        let id: ConnectionId = "conn_abc".into();
        assert_eq!(id.to_string(), "conn_abc");
        assert_eq!(ConnectionId::from(String::from("x")), ConnectionId::new("x"));
    }
}
