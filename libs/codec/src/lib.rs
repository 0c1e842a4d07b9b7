//! # Message Codec
//!
//! ## Purpose
//!
//! Typed application messages carried inside the engine's length-prefixed
//! frames. The engine treats payloads as opaque bytes; this crate gives them
//! meaning on either side of the connection.
//!
//! ## Architecture Role
//!
//! ```text
//! application → [codec: encode_into] → engine send segment → wire
//! wire → engine framer → [codec: MessageRegistry::decode] → application
//! ```
//!
//! ## Payload Layout
//!
//! ```text
//! [u8 message type][u8 layout version][fixed little-endian body]
//! ```
//!
//! A version the registry does not expect is a protocol violation; the
//! engine closes the session rather than guessing at the layout.

pub mod error;
pub mod message;
pub mod registry;

pub use error::{CodecError, Result};
pub use message::{
    decode, encode_into, to_bytes, MessageHeader, MessageType, Ping, Pong, WireMessage,
    MESSAGE_HEADER_LEN,
};
pub use registry::{DecodedMessage, MessageRegistry};
