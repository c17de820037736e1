//! # beacon-server
//!
//! HTTP and WebSocket front end for the Beacon presence and routing
//! engine. [`handlers::run_server`] binds the configured address and
//! serves the upgrade endpoints, the polling fallback and `/health`.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
