//! # beacon-transport
//!
//! Transport layer for the Beacon realtime server.
//!
//! - **WebSocket** - persistent socket, the default
//! - **Polling** - HTTP push plus long-poll fallback for clients that
//!   cannot keep a socket open
//!
//! Both implement [`Connection`], so the server is transport-agnostic.
//!
//! ```rust,ignore
//! use beacon_transport::Connection;
//!
//! async fn handle_connection(mut conn: impl Connection) {
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod polling;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use polling::{PollingConfig, PollingConnection, PollingRegistry};
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
