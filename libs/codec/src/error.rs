//! Codec errors for payload encoding and decoding
//!
//! Every variant carries enough context to tell a truncated payload apart from
//! a peer speaking a different message version.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Payload is shorter than the message header or the declared body
    #[error("Payload too small: need {need} bytes, got {got} (context: {context})")]
    PayloadTooSmall {
        need: usize,
        got: usize,
        context: &'static str,
    },

    /// Output buffer cannot hold the encoded message
    #[error("Buffer too small: message needs {need} bytes, buffer has {capacity}")]
    BufferTooSmall { need: usize, capacity: usize },

    /// Message type id is not a known `MessageType`
    #[error("Unknown message type {message_type}")]
    UnknownMessageType { message_type: u8 },

    /// Message type is known but nothing was registered to decode it
    #[error("Message type {message_type} is not registered")]
    NotRegistered { message_type: u8 },

    /// Peer encoded the message with a different layout version
    #[error("Version mismatch for message type {message_type}: expected {expected}, got {actual}")]
    VersionMismatch {
        message_type: u8,
        expected: u8,
        actual: u8,
    },

    /// Decoded message is not the type the caller asked for
    #[error("Unexpected message type {actual}, expected {expected}")]
    UnexpectedType { expected: u8, actual: u8 },
}

pub type Result<T> = std::result::Result<T, CodecError>;
