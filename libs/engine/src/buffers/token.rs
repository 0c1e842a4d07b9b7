//! Packed segment identity
//!
//! A token is the only thing that travels through the facility while a
//! segment is in flight. It packs the pool, the buffer within the pool and the
//! segment within the buffer into one `u64`, so routing a completion back to
//! its memory is a shift and a table index.
//!
//! ```text
//! | 63 .. 56 | 55 .. 32  | 31 .. 0       |
//! | pool id  | buffer    | segment index |
//! ```

const SEGMENT_BITS: u32 = 32;
const BUFFER_BITS: u32 = 24;
const BUFFER_MASK: u64 = (1 << BUFFER_BITS) - 1;
const SEGMENT_MASK: u64 = (1 << SEGMENT_BITS) - 1;

/// Buffers a single pool can ever hold
pub const MAX_BUFFERS_PER_POOL: u32 = 1 << BUFFER_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentToken(u64);

impl SegmentToken {
    #[inline]
    pub const fn new(pool_id: u8, buffer_index: u32, segment_index: u32) -> Self {
        Self(
            ((pool_id as u64) << (BUFFER_BITS + SEGMENT_BITS))
                | (((buffer_index as u64) & BUFFER_MASK) << SEGMENT_BITS)
                | segment_index as u64,
        )
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn pool_id(self) -> u8 {
        (self.0 >> (BUFFER_BITS + SEGMENT_BITS)) as u8
    }

    #[inline]
    pub const fn buffer_index(self) -> u32 {
        ((self.0 >> SEGMENT_BITS) & BUFFER_MASK) as u32
    }

    #[inline]
    pub const fn segment_index(self) -> u32 {
        (self.0 & SEGMENT_MASK) as u32
    }
}

impl std::fmt::Display for SegmentToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.pool_id(),
            self.buffer_index(),
            self.segment_index()
        )
    }
}
