//! Per-frame authentication and presence signalling.
//!
//! Every inbound frame goes through [`ChannelAuthInterceptor::pre_send`]
//! before it reaches the router. The interceptor never rejects a frame:
//! a failed re-authentication on CONNECT leaves the session without a
//! principal and the frame continues.

use super::token::TokenValidator;
use super::Principal;
use crate::presence::PresenceTracker;
use crate::session::Session;
use beacon_protocol::{headers, Command, Frame};
use std::sync::Arc;
use tracing::{debug, trace};

/// What the interceptor did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    /// CONNECT with a valid principal; the session is now online.
    Connected,
    /// CONNECT whose frame-level credentials were missing or invalid.
    AuthIgnored,
    /// Activity from an authenticated session refreshed its lease.
    Refreshed,
    /// DISCONNECT closed the session.
    Disconnected,
    /// Nothing to do.
    PassedThrough,
}

/// Attaches identity to frames and drives the presence tracker.
#[derive(Clone)]
pub struct ChannelAuthInterceptor {
    validator: Arc<dyn TokenValidator>,
    presence: Arc<PresenceTracker>,
}

impl ChannelAuthInterceptor {
    /// Create an interceptor.
    #[must_use]
    pub fn new(validator: Arc<dyn TokenValidator>, presence: Arc<PresenceTracker>) -> Self {
        Self {
            validator,
            presence,
        }
    }

    /// Inspect an inbound frame for `session`.
    pub fn pre_send(&self, frame: &Frame, session: &mut Session) -> Interception {
        if session.is_closed() {
            return Interception::PassedThrough;
        }

        match frame.command {
            Some(command) if command.is_connect() => self.on_connect(frame, session),
            Some(Command::Disconnect) if session.principal().is_some() => {
                session.close(&self.presence);
                Interception::Disconnected
            }
            None | Some(Command::Send | Command::Subscribe) => self.on_activity(session),
            _ => Interception::PassedThrough,
        }
    }

    fn on_connect(&self, frame: &Frame, session: &mut Session) -> Interception {
        if session.principal().is_none() {
            match self.authenticate_frame(frame) {
                Some(principal) => {
                    session.attach_principal(principal);
                }
                None => {
                    debug!(session = %session.id(), "CONNECT without valid credentials");
                    return Interception::AuthIgnored;
                }
            }
        }

        let Some(principal) = session.principal() else {
            return Interception::AuthIgnored;
        };
        self.presence.mark_online(principal.name(), session.id());
        session.activate();
        Interception::Connected
    }

    fn on_activity(&self, session: &mut Session) -> Interception {
        let Some(principal) = session.principal() else {
            return Interception::PassedThrough;
        };
        trace!(session = %session.id(), user = %principal, "Refreshing presence");
        self.presence.refresh(principal.name(), session.id());
        session.activate();
        Interception::Refreshed
    }

    fn authenticate_frame(&self, frame: &Frame) -> Option<Principal> {
        let token = resolve_frame_token(frame)?;
        let user_id = match self.validator.extract_user_id(&token) {
            Ok(user_id) => user_id,
            Err(e) => {
                debug!(error = %e, "Frame token rejected");
                return None;
            }
        };
        if self.validator.is_token_expired(&token) {
            debug!(user = %user_id, "Frame token expired");
            return None;
        }
        Some(Principal::new(user_id))
    }
}

/// Find a token in CONNECT headers: `Authorization` (with or without the
/// `Bearer ` prefix), then `token`, then `access_token`.
#[must_use]
pub fn resolve_frame_token(frame: &Frame) -> Option<String> {
    let authorization = frame
        .header(headers::AUTHORIZATION)
        .or_else(|| frame.header("authorization"))
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value));

    [
        authorization,
        frame.header(headers::TOKEN),
        frame.header(headers::ACCESS_TOKEN),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|token| !token.is_empty())
    .map(str::to_string)
}
