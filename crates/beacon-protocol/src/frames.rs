//! Frame types for the Beacon protocol.
//!
//! Frames follow the STOMP layout: a command line, `key:value` header
//! lines, a blank line, an optional body and a terminating NUL octet.
//! A bare end-of-line on the wire is a heartbeat and carries no command.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Header names used by the server.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const TOKEN: &str = "token";
    pub const USER_NAME: &str = "user-name";
    pub const VERSION: &str = "version";
}

/// Frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// The command line as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// `STOMP` is accepted as a synonym for `CONNECT`.
    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self, Command::Connect | Command::Stomp)
    }

    /// Header values of CONNECT and CONNECTED frames are never escaped.
    #[must_use]
    pub fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "CONNECTED" => Ok(Command::Connected),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "BEGIN" => Ok(Command::Begin),
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "DISCONNECT" => Ok(Command::Disconnect),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            _ => Err("Unknown command"),
        }
    }
}

/// Ordered frame headers.
///
/// Repeated keys are kept; lookups return the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the first value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Append a header, keeping any existing value for the same key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Replace every value for a key with a single one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.0.retain(|(k, _)| *k != key);
        self.0.push((key, value.into()));
    }

    /// Check whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Iterate headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A protocol frame.
///
/// `command` is `None` for heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Option<Command>,
    pub headers: Headers,
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with the given command and no headers.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command: Some(command),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Create a heartbeat.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            command: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.command.is_none()
    }

    /// Add a header (builder style).
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    /// Set the body (builder style).
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Body as UTF-8, if it is valid.
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Create a CONNECT frame.
    #[must_use]
    pub fn connect(accept_version: &str) -> Self {
        Frame::new(Command::Connect).with_header(headers::ACCEPT_VERSION, accept_version)
    }

    /// Create a CONNECTED frame.
    #[must_use]
    pub fn connected(version: &str, session: &str, heart_beat: (u64, u64)) -> Self {
        Frame::new(Command::Connected)
            .with_header(headers::VERSION, version)
            .with_header(headers::SESSION, session)
            .with_header(
                headers::HEART_BEAT,
                format!("{},{}", heart_beat.0, heart_beat.1),
            )
            .with_header(
                headers::SERVER,
                concat!("beacon/", env!("CARGO_PKG_VERSION")),
            )
    }

    /// Create a SUBSCRIBE frame.
    #[must_use]
    pub fn subscribe(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Frame::new(Command::Subscribe)
            .with_header(headers::ID, id)
            .with_header(headers::DESTINATION, destination)
    }

    /// Create an UNSUBSCRIBE frame.
    #[must_use]
    pub fn unsubscribe(id: impl Into<String>) -> Self {
        Frame::new(Command::Unsubscribe).with_header(headers::ID, id)
    }

    /// Create a SEND frame.
    #[must_use]
    pub fn send(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Frame::new(Command::Send)
            .with_header(headers::DESTINATION, destination)
            .with_body(body)
    }

    /// Create a MESSAGE frame for delivery to a subscription.
    #[must_use]
    pub fn message(
        destination: impl Into<String>,
        subscription: impl Into<String>,
        message_id: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Frame::new(Command::Message)
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::SUBSCRIPTION, subscription)
            .with_header(headers::MESSAGE_ID, message_id)
            .with_body(body)
    }

    /// Create a RECEIPT frame.
    #[must_use]
    pub fn receipt(receipt_id: impl Into<String>) -> Self {
        Frame::new(Command::Receipt).with_header(headers::RECEIPT_ID, receipt_id)
    }

    /// Create an ERROR frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Frame::new(Command::Error).with_header(headers::MESSAGE, message)
    }

    /// Create a DISCONNECT frame.
    #[must_use]
    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }
}
