//! # beacon-core
//!
//! Authentication, presence and message routing for the Beacon realtime
//! server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Auth** - Token validation, handshake and per-frame authentication
//! - **Presence** - Multi-session online/offline tracking with TTL expiry
//! - **Router** - Topic broadcast and per-user directed delivery
//! - **Session** - Per-connection identity and lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Handshake  │────▶│ Interceptor │────▶│  Presence   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                     ┌─────────────┐     ┌──────▼──────┐
//!   producers ───────▶│   Router    │────▶│  EventBus   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod auth;
pub mod channel;
pub mod event;
pub mod message;
pub mod presence;
pub mod router;
pub mod session;

pub use auth::{
    ChannelAuthInterceptor, HandshakeAuthenticator, HandshakeRejected, Interception,
    JwtValidator, Principal, TokenError, TokenValidator,
};
pub use channel::{Channel, ChannelId};
pub use event::{DeliveryEvent, EventBus};
pub use message::{Delivery, Message};
pub use presence::{PresenceTracker, SessionLease, DEFAULT_PRESENCE_TTL};
pub use router::{Router, RouterConfig, RouterError, RouterStats, Subscription};
pub use session::{Session, SessionId, SessionState};
