//! Typed messages and their fixed wire layouts
//!
//! Every payload starts with a two byte [`MessageHeader`] (type id, layout
//! version) followed by a fixed-size little-endian body. Bodies are `zerocopy`
//! structs so encoding is a single copy into the caller's buffer and decoding
//! reads straight out of the received slice.

use crate::error::{CodecError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use zerocopy::byteorder::{LittleEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Ref, Unaligned};

/// Known message type ids
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum MessageType {
    /// Liveness probe carrying a caller-chosen id
    Ping = 1,
    /// Reply to a `Ping`, echoing its id
    Pong = 2,
}

/// Header prepended to every payload
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct MessageHeader {
    pub message_type: u8,
    pub version: u8,
}

pub const MESSAGE_HEADER_LEN: usize = std::mem::size_of::<MessageHeader>();

impl MessageHeader {
    /// Read the header at the front of a payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ref::<_, MessageHeader>::new_from_prefix(payload)
            .map(|(header, _)| *header)
            .ok_or(CodecError::PayloadTooSmall {
                need: MESSAGE_HEADER_LEN,
                got: payload.len(),
                context: "message header",
            })
    }

    /// Resolve the type id against the known message types
    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.message_type).map_err(|_| CodecError::UnknownMessageType {
            message_type: self.message_type,
        })
    }
}

/// A message with a fixed binary layout
pub trait WireMessage: Sized + Send + 'static {
    const MESSAGE_TYPE: MessageType;
    const VERSION: u8;

    /// Body size in bytes, excluding the header
    fn body_len(&self) -> usize;

    /// Write the body into `out`, which is exactly `body_len()` bytes
    fn write_body(&self, out: &mut [u8]);

    /// Parse a body that has already passed type and version checks
    fn read_body(body: &[u8]) -> Result<Self>;

    /// Total encoded size including the header
    fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.body_len()
    }
}

/// Encode `message` into the front of `out`, returning the bytes written
pub fn encode_into<M: WireMessage>(message: &M, out: &mut [u8]) -> Result<usize> {
    let need = message.encoded_len();
    if out.len() < need {
        return Err(CodecError::BufferTooSmall {
            need,
            capacity: out.len(),
        });
    }

    let header = MessageHeader {
        message_type: M::MESSAGE_TYPE as u8,
        version: M::VERSION,
    };
    out[..MESSAGE_HEADER_LEN].copy_from_slice(header.as_bytes());
    message.write_body(&mut out[MESSAGE_HEADER_LEN..need]);
    Ok(need)
}

/// Encode `message` into a freshly allocated buffer
pub fn to_bytes<M: WireMessage>(message: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.encoded_len());
    buf.put_u8(M::MESSAGE_TYPE as u8);
    buf.put_u8(M::VERSION);
    buf.resize(message.encoded_len(), 0);
    message.write_body(&mut buf[MESSAGE_HEADER_LEN..]);
    buf.freeze()
}

/// Decode a payload that must hold an `M`
pub fn decode<M: WireMessage>(payload: &[u8]) -> Result<M> {
    let header = MessageHeader::parse(payload)?;
    if header.message_type != M::MESSAGE_TYPE as u8 {
        return Err(CodecError::UnexpectedType {
            expected: M::MESSAGE_TYPE as u8,
            actual: header.message_type,
        });
    }
    if header.version != M::VERSION {
        return Err(CodecError::VersionMismatch {
            message_type: header.message_type,
            expected: M::VERSION,
            actual: header.version,
        });
    }
    M::read_body(&payload[MESSAGE_HEADER_LEN..])
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
struct IdBody {
    id: U64<LittleEndian>,
}

const ID_BODY_LEN: usize = std::mem::size_of::<IdBody>();

fn read_id(body: &[u8], context: &'static str) -> Result<u64> {
    Ref::<_, IdBody>::new_from_prefix(body)
        .map(|(fields, _)| fields.id.get())
        .ok_or(CodecError::PayloadTooSmall {
            need: ID_BODY_LEN,
            got: body.len(),
            context,
        })
}

fn write_id(id: u64, out: &mut [u8]) {
    let fields = IdBody { id: U64::new(id) };
    out.copy_from_slice(fields.as_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: u64,
}

impl WireMessage for Ping {
    const MESSAGE_TYPE: MessageType = MessageType::Ping;
    const VERSION: u8 = 1;

    fn body_len(&self) -> usize {
        ID_BODY_LEN
    }

    fn write_body(&self, out: &mut [u8]) {
        write_id(self.id, out)
    }

    fn read_body(body: &[u8]) -> Result<Self> {
        read_id(body, "ping body").map(|id| Ping { id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub ping_id: u64,
}

impl WireMessage for Pong {
    const MESSAGE_TYPE: MessageType = MessageType::Pong;
    const VERSION: u8 = 1;

    fn body_len(&self) -> usize {
        ID_BODY_LEN
    }

    fn write_body(&self, out: &mut [u8]) {
        write_id(self.ping_id, out)
    }

    fn read_body(body: &[u8]) -> Result<Self> {
        read_id(body, "pong body").map(|ping_id| Pong { ping_id })
    }
}
