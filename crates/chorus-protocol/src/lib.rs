//! # chorus-protocol
//!
//! Wire protocol for the Chorus realtime chat/call engine.
//!
//! Defines the frames exchanged between clients and servers: chat actions,
//! call lifecycle actions, opaque media-negotiation signaling, and server
//! event pushes, together with the MessagePack codec used on the wire.
//!
//! ## Example
//!
//! ```rust
//! use chorus_protocol::{codec, Frame};
//!
//! let frame = Frame::connect("dev-token");
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{error_codes, CallKind, Frame, MessageKind, PROTOCOL_VERSION};
