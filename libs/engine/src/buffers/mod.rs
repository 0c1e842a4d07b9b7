//! Segment buffers shared between producers, the request processor and the
//! facility
//!
//! The engine runs two pools: one for outbound frames and one for posted
//! receives. A token's pool id selects the pool, so completions route back to
//! the right one without a lookup table.

pub mod pool;
pub mod segment;
pub mod token;

pub use pool::{PoolStats, SegmentPool};
pub use segment::Segment;
pub use token::SegmentToken;

use std::sync::Arc;

pub const SEND_POOL_ID: u8 = 0;
pub const RECEIVE_POOL_ID: u8 = 1;

/// The engine's send and receive pools, addressed by pool id
#[derive(Debug, Clone)]
pub struct PoolSet {
    send: Arc<SegmentPool>,
    receive: Arc<SegmentPool>,
}

impl PoolSet {
    pub fn new(send: Arc<SegmentPool>, receive: Arc<SegmentPool>) -> Self {
        debug_assert_eq!(send.pool_id(), SEND_POOL_ID);
        debug_assert_eq!(receive.pool_id(), RECEIVE_POOL_ID);
        Self { send, receive }
    }

    pub fn send(&self) -> &Arc<SegmentPool> {
        &self.send
    }

    pub fn receive(&self) -> &Arc<SegmentPool> {
        &self.receive
    }

    #[inline]
    pub fn pool_for(&self, token: SegmentToken) -> Option<&Arc<SegmentPool>> {
        match token.pool_id() {
            SEND_POOL_ID => Some(&self.send),
            RECEIVE_POOL_ID => Some(&self.receive),
            _ => None,
        }
    }

    /// Return a segment to whichever pool it came from
    #[inline]
    pub fn release(&self, segment: Segment) {
        match self.pool_for(segment.token()) {
            Some(pool) => pool.release(segment),
            None => tracing::error!(token = %segment.token(), "Segment from unknown pool"),
        }
    }

    #[inline]
    pub fn hand_off(&self, segment: Segment) -> SegmentToken {
        match self.pool_for(segment.token()) {
            Some(pool) => pool.hand_off(segment),
            None => segment.token(),
        }
    }

    #[inline]
    pub fn reclaim(&self, token: SegmentToken) -> Option<Segment> {
        self.pool_for(token)?.reclaim(token)
    }

    pub fn close(&self) {
        self.send.close();
        self.receive.close();
    }
}
