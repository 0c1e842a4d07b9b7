//! Frame encoding helpers for producers

use crate::{EngineError, Result};
use byteorder::{ByteOrder, LittleEndian};

pub const FRAME_HEADER_LEN: usize = engine_config::defaults::frame::HEADER_LEN;

/// Bytes a frame with a `body_len` body occupies on the wire
#[inline]
pub const fn frame_len(body_len: usize) -> usize {
    FRAME_HEADER_LEN + body_len
}

/// Write the length prefix for a `body_len` body into the first four bytes
#[inline]
pub fn write_frame_header(out: &mut [u8], body_len: u32) {
    LittleEndian::write_u32(&mut out[..FRAME_HEADER_LEN], body_len);
}

/// Read the length prefix at the front of `bytes`
#[inline]
pub fn read_frame_header(bytes: &[u8]) -> u32 {
    LittleEndian::read_u32(&bytes[..FRAME_HEADER_LEN])
}

/// Encode `payload` as a frame at the front of `out`, returning the frame length
pub fn encode_frame(payload: &[u8], out: &mut [u8]) -> Result<usize> {
    let len = frame_len(payload.len());
    if out.len() < len {
        return Err(EngineError::protocol(format!(
            "frame of {} bytes does not fit in {} byte buffer",
            len,
            out.len()
        )));
    }
    let body_len = u32::try_from(payload.len())
        .map_err(|_| EngineError::protocol("payload longer than u32::MAX"))?;
    write_frame_header(out, body_len);
    out[FRAME_HEADER_LEN..len].copy_from_slice(payload);
    Ok(len)
}

/// A frame with an empty body, ignored by receivers
#[inline]
pub const fn padding_frame() -> [u8; FRAME_HEADER_LEN] {
    [0; FRAME_HEADER_LEN]
}
