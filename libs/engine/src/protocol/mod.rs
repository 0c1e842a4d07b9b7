//! Wire framing: `[u32 little-endian body length][body]`
//!
//! A zero length prefix is a padding frame. Receivers absorb it silently and
//! never surface an empty message.

pub mod frame;
pub mod framer;

pub use frame::{encode_frame, frame_len, padding_frame, read_frame_header, write_frame_header, FRAME_HEADER_LEN};
pub use framer::MessageFramer;
