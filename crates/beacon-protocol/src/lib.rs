//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon presence and routing server.
//!
//! Beacon speaks STOMP-style text frames over a persistent socket or a
//! polling fallback. This crate defines the frames, the streaming codec,
//! version negotiation and the destination namespaces.
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Frame};
//!
//! let frame = Frame::send("/topic/notifications", "hello");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.body_str(), Some("hello"));
//! ```

pub mod codec;
pub mod destination;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use destination::Destination;
pub use frames::{headers, Command, Frame, Headers};
pub use version::{Version, PROTOCOL_VERSION};
