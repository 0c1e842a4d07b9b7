//! Sessions: one per connected socket
//!
//! Sessions are preallocated and recycled. Each carries a generation that is
//! bumped whenever it closes; requests and completions tagged with an older
//! generation are recognised as stale and dropped.
//!
//! ```text
//! Free ──acquire──▶ Acquired ──open──▶ Active ──close──▶ Closing ──drained──▶ Free
//! ```

pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;

pub use manager::SessionManager;
pub use session::{Session, SessionState};

use crate::engine::EngineHandle;

pub type SessionId = u32;

/// Pack a session id and generation into the facility's session correlation
#[inline]
pub const fn session_correlation(session_id: SessionId, generation: u32) -> u64 {
    ((generation as u64) << 32) | session_id as u64
}

/// Split a session correlation into id and generation
#[inline]
pub const fn split_correlation(correlation: u64) -> (SessionId, u32) {
    (correlation as u32, (correlation >> 32) as u32)
}

/// A complete inbound message
pub struct ReceivedMessage<'a> {
    pub session_id: SessionId,
    pub peer_id: Option<&'a str>,
    /// Frame body; only valid for the duration of the callback
    pub payload: &'a [u8],
    /// Handle for replying from inside the callback
    pub engine: &'a EngineHandle,
}

/// Application callbacks, invoked on the receive completion thread
pub trait SessionHandler: Send + Sync + 'static {
    fn on_message(&self, message: &ReceivedMessage<'_>);

    /// Raised exactly once per opened session
    fn on_closed(&self, _session_id: SessionId, _peer_id: Option<&str>) {}
}

/// Snapshot of an active session for callers outside the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub generation: u32,
    pub peer_id: Option<String>,
}
