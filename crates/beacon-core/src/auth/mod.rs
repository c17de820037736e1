//! Authentication for connections and frames.
//!
//! - [`token`] validates bearer tokens
//! - [`handshake`] gates connection upgrades
//! - [`interceptor`] attaches identity to inbound frames and drives presence

pub mod handshake;
pub mod interceptor;
pub mod token;

use std::fmt;

pub use handshake::{HandshakeAuthenticator, HandshakeRejected};
pub use interceptor::{ChannelAuthInterceptor, Interception};
pub use token::{Claims, JwtValidator, TokenError, TokenValidator};

/// An authenticated identity.
///
/// Only produced from a validated token. The name is the user id and is
/// also the address used for per-user delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub(crate) fn new(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    /// The user id.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
