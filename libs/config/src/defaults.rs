//! Framing constants and sizing defaults
//!
//! Values shared by the engine and its configuration. The frame layout is the
//! binary contract with the peer and must not change between releases.

/// Frame layout on the wire: `[u32 little-endian body length][body]`
pub mod frame {
    /// Size of the length prefix in bytes
    pub const HEADER_LEN: usize = 4;

    /// Largest body a peer may announce before the stream is considered corrupt
    pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;
}

/// Segment pool defaults
pub mod pools {
    /// Send segment size; one segment carries one or more frames
    pub const SEND_SEGMENT_LENGTH: usize = 4 * 1024;

    /// Send segments available across all sessions
    pub const SEND_SEGMENT_COUNT: usize = 4096;

    /// Receive segment size
    pub const RECEIVE_SEGMENT_LENGTH: usize = 16 * 1024;

    /// Receive segments available across all sessions
    pub const RECEIVE_SEGMENT_COUNT: usize = 1024;

    /// How long a producer waits for a free send segment (milliseconds)
    pub const BUFFER_ACQUIRE_TIMEOUT_MS: u64 = 1_000;
}

/// Session defaults
pub mod sessions {
    /// Pre-allocated sessions
    pub const SESSION_COUNT: usize = 64;

    /// Receive segments posted per session
    pub const MAX_OUTSTANDING_RECEIVES: usize = 2;

    /// Send requests a single request queue accepts before it is flushed
    pub const MAX_OUTSTANDING_SENDS: usize = 256;
}

/// Request ring and processing defaults
pub mod processing {
    /// Ring capacity (must be a power of two)
    pub const RING_CAPACITY: usize = 16 * 1024;

    /// How long a blocking producer spins for a free ring slot (microseconds)
    pub const RING_CLAIM_TIMEOUT_US: u64 = 100_000;

    /// Deferred submissions per session before a flush is forced
    pub const MAX_BATCH_SIZE: usize = 32;

    /// Messages merged into a single not-yet-submitted send segment
    pub const MAX_CONFLATION_COUNT: usize = 64;

    /// Completion results drained per poll
    pub const MAX_COMPLETION_RESULTS: usize = 256;
}
