//! Segment Pool
//!
//! Fixed-size segments carved out of registered buffers. Free segments live in
//! a lock-free queue; a counting semaphore tracks how many are free so renters
//! can block with a bound instead of spinning on an empty queue.
//!
//! Each segment carries an atomic state:
//!
//! ```text
//! FREE ──rent──▶ RENTED ──hand_off──▶ IN_FLIGHT
//!  ▲               │  ▲                   │
//!  └───release─────┘  └─────reclaim───────┘
//!
//! any segment of a removed buffer ──▶ RETIRED
//! ```
//!
//! A completion that names a segment which is not `IN_FLIGHT` finds nothing to
//! reclaim, so late or duplicate completions cannot return a segment twice.
//! Removing a buffer retires its free segments at once and the rest as they
//! come home; the region is deregistered and freed after the last one.

use super::segment::Segment;
use super::token::{SegmentToken, MAX_BUFFERS_PER_POOL};
use crate::facility::{BufferId, Facility, RegionHandle};
use crate::sync::{AcquireError, Semaphore};
use crate::{EngineError, Result};
use engine_config::PoolConfig;
use lockfree::queue::Queue;
use parking_lot::{Mutex, RwLock};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const FREE: u8 = 0;
const RENTED: u8 = 1;
const IN_FLIGHT: u8 = 2;
const RETIRED: u8 = 3;

/// One registered region split into segments
pub(crate) struct PoolBuffer {
    index: u32,
    base: NonNull<u8>,
    segment_length: u32,
    registration: BufferId,
    states: Box<[AtomicU8]>,
    /// False once the buffer is being removed
    pooled: AtomicBool,
    /// Segments not yet retired
    live: AtomicU32,
    region: Mutex<Option<RegionHandle>>,
    memory: Arc<dyn Facility>,
}

// SAFETY: `base` points into `region`, which lives as long as the buffer;
// segment bytes are only touched by the current owner of the segment.
unsafe impl Send for PoolBuffer {}
unsafe impl Sync for PoolBuffer {}

impl PoolBuffer {
    #[inline]
    pub(crate) fn segment_length(&self) -> u32 {
        self.segment_length
    }

    #[inline]
    pub(crate) fn registration(&self) -> BufferId {
        self.registration
    }

    #[inline]
    pub(crate) fn segment_offset(&self, token: SegmentToken) -> u32 {
        token.segment_index() * self.segment_length
    }

    #[inline]
    pub(crate) fn segment_ptr(&self, token: SegmentToken) -> *mut u8 {
        // SAFETY: tokens are only minted for indices inside this buffer.
        unsafe { self.base.as_ptr().add(self.segment_offset(token) as usize) }
    }

    #[inline]
    fn state(&self, token: SegmentToken) -> Option<&AtomicU8> {
        self.states.get(token.segment_index() as usize)
    }

    fn segment_count(&self) -> u32 {
        self.states.len() as u32
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(region) = self.region.lock().take() {
            if let Err(e) = self.memory.deregister(self.registration) {
                warn!(
                    buffer_index = self.index,
                    error = %e,
                    "Failed to deregister pool buffer"
                );
            }
            self.memory.free(region);
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_id: u8,
    pub segment_length: usize,
    /// Segments in buffers that are still pooled
    pub capacity: usize,
    /// Free permits
    pub available: usize,
    /// Segments rented or in flight
    pub in_use: usize,
    pub buffers: usize,
}

pub struct SegmentPool {
    pool_id: u8,
    segment_length: u32,
    acquire_timeout: Duration,
    memory: Arc<dyn Facility>,
    /// Indexed by buffer index; slots are never reused
    buffers: RwLock<Vec<Option<Arc<PoolBuffer>>>>,
    free: Queue<SegmentToken>,
    permits: Semaphore,
    capacity: AtomicUsize,
    in_use: AtomicUsize,
}

impl SegmentPool {
    /// Create a pool and populate it with one buffer of `segment_count` segments
    pub fn new(pool_id: u8, config: &PoolConfig, memory: Arc<dyn Facility>) -> Result<Arc<Self>> {
        let segment_length = u32::try_from(config.segment_length).map_err(|_| {
            EngineError::configuration("segment length must fit in 32 bits", Some("segment_length"))
        })?;
        if segment_length == 0 {
            return Err(EngineError::configuration(
                "segment length must be greater than zero",
                Some("segment_length"),
            ));
        }

        let pool = Arc::new(Self {
            pool_id,
            segment_length,
            acquire_timeout: config.acquire_timeout(),
            memory,
            buffers: RwLock::new(Vec::new()),
            free: Queue::new(),
            permits: Semaphore::new(0),
            capacity: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        });
        pool.add_buffer(config.segment_count)?;
        Ok(pool)
    }

    pub fn pool_id(&self) -> u8 {
        self.pool_id
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length as usize
    }

    /// Rent a segment, waiting up to the configured acquire timeout
    pub fn rent(&self) -> Result<Segment> {
        self.rent_timeout(self.acquire_timeout)
    }

    /// Rent a segment, waiting up to `timeout` for one to be released
    pub fn rent_timeout(&self, timeout: Duration) -> Result<Segment> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.permits.acquire_timeout(remaining) {
                Ok(()) => {}
                Err(AcquireError::Timeout) => {
                    return Err(EngineError::timeout(
                        format!("segment rent from pool {}", self.pool_id),
                        timeout.as_millis() as u64,
                    ))
                }
                Err(AcquireError::Closed) => {
                    return Err(EngineError::PoolClosed {
                        pool_id: self.pool_id,
                    })
                }
            }
            if let Some(segment) = self.take_free() {
                return Ok(segment);
            }
        }
    }

    /// Rent a segment only if one is free right now
    pub fn try_rent(&self) -> Result<Option<Segment>> {
        loop {
            match self.permits.try_acquire() {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(_) => {
                    return Err(EngineError::PoolClosed {
                        pool_id: self.pool_id,
                    })
                }
            }
            if let Some(segment) = self.take_free() {
                return Ok(Some(segment));
            }
        }
    }

    /// Pop a token backed by the permit the caller already holds. `None` means
    /// the token belonged to a retired segment and the caller must try again.
    fn take_free(&self) -> Option<Segment> {
        let token = loop {
            // The permit guarantees a token; a concurrent push may still be
            // linking it into the queue.
            match self.free.pop() {
                Some(token) => break token,
                None => std::hint::spin_loop(),
            }
        };

        let buffer = self.buffer(token)?;
        let state = buffer.state(token)?;
        if state
            .compare_exchange(FREE, RENTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        if !buffer.pooled.load(Ordering::SeqCst) {
            state.store(RETIRED, Ordering::Release);
            self.retire_one(&buffer);
            return None;
        }

        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(Segment::new(buffer, token))
    }

    /// Return a rented segment to the pool
    pub fn release(&self, segment: Segment) {
        let token = segment.token();
        debug_assert_eq!(token.pool_id(), self.pool_id);
        let buffer = segment.buffer().clone();
        drop(segment);
        self.in_use.fetch_sub(1, Ordering::Relaxed);

        let Some(state) = buffer.state(token) else {
            return;
        };
        state.store(FREE, Ordering::SeqCst);
        if !buffer.pooled.load(Ordering::SeqCst) {
            if state
                .compare_exchange(FREE, RETIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.retire_one(&buffer);
            }
            return;
        }

        self.free.push(token);
        self.permits.release(1);
    }

    /// Move a rented segment into the facility, keeping only its token
    pub fn hand_off(&self, segment: Segment) -> SegmentToken {
        let token = segment.token();
        if let Some(state) = segment.buffer().state(token) {
            let swapped = state.compare_exchange(RENTED, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire);
            debug_assert!(swapped.is_ok(), "handed off segment {} was not rented", token);
        }
        token
    }

    /// Take back ownership of an in-flight segment. Returns `None` for tokens
    /// that are unknown or not in flight.
    pub fn reclaim(&self, token: SegmentToken) -> Option<Segment> {
        if token.pool_id() != self.pool_id {
            return None;
        }
        let buffer = self.buffer(token)?;
        buffer
            .state(token)?
            .compare_exchange(IN_FLIGHT, RENTED, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Segment::new(buffer, token))
    }

    /// Register a new region holding `segment_count` segments. Returns the
    /// buffer index used in tokens.
    pub fn add_buffer(&self, segment_count: usize) -> Result<u32> {
        let count = u32::try_from(segment_count)
            .ok()
            .filter(|&count| count > 0)
            .ok_or_else(|| {
                EngineError::configuration("segment count must be in 1..=u32::MAX", Some("segment_count"))
            })?;
        let length = segment_count
            .checked_mul(self.segment_length as usize)
            .filter(|&len| len <= u32::MAX as usize)
            .ok_or_else(|| {
                EngineError::configuration("buffer exceeds 4 GiB", Some("segment_count"))
            })?;

        let region = self.memory.allocate(length)?;
        let registration = match self.memory.register(&region) {
            Ok(id) => id,
            Err(e) => {
                self.memory.free(region);
                return Err(e);
            }
        };

        let index = {
            let mut buffers = self.buffers.write();
            let index = buffers.len() as u32;
            if index >= MAX_BUFFERS_PER_POOL {
                drop(buffers);
                let _ = self.memory.deregister(registration);
                self.memory.free(region);
                return Err(EngineError::backpressure(
                    format!("segment pool {}", self.pool_id),
                    "buffer table is full",
                ));
            }
            buffers.push(Some(Arc::new(PoolBuffer {
                index,
                base: region.non_null(),
                segment_length: self.segment_length,
                registration,
                states: (0..count).map(|_| AtomicU8::new(FREE)).collect(),
                pooled: AtomicBool::new(true),
                live: AtomicU32::new(count),
                region: Mutex::new(Some(region)),
                memory: self.memory.clone(),
            })));
            index
        };

        for segment_index in 0..count {
            self.free
                .push(SegmentToken::new(self.pool_id, index, segment_index));
        }
        self.capacity.fetch_add(count as usize, Ordering::Relaxed);
        self.permits.release(count as usize);

        info!(
            pool_id = self.pool_id,
            buffer_index = index,
            segment_count = count,
            segment_length = self.segment_length,
            "Added buffer to segment pool"
        );
        Ok(index)
    }

    /// Take a buffer out of rotation. Free segments retire now, rented and
    /// in-flight ones when they come back.
    pub fn remove_buffer(&self, buffer_index: u32) -> Result<()> {
        let buffer = self
            .buffers
            .read()
            .get(buffer_index as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| {
                EngineError::configuration(
                    format!("pool {} has no buffer {}", self.pool_id, buffer_index),
                    Some("buffer_index"),
                )
            })?;

        if !buffer.pooled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.capacity
            .fetch_sub(buffer.segment_count() as usize, Ordering::Relaxed);

        let mut retired = 0usize;
        for state in buffer.states.iter() {
            if state
                .compare_exchange(FREE, RETIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                retired += 1;
                self.retire_one(&buffer);
            }
        }

        info!(
            pool_id = self.pool_id,
            buffer_index,
            retired_now = retired,
            outstanding = buffer.segment_count() as usize - retired,
            "Removing buffer from segment pool"
        );
        Ok(())
    }

    fn retire_one(&self, buffer: &Arc<PoolBuffer>) {
        if buffer.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last segment home: dropping the table entry frees the region
            // once the caller's reference goes away.
            if let Some(slot) = self.buffers.write().get_mut(buffer.index as usize) {
                *slot = None;
            }
            debug!(
                pool_id = self.pool_id,
                buffer_index = buffer.index,
                "Pool buffer fully retired"
            );
        }
    }

    #[inline]
    fn buffer(&self, token: SegmentToken) -> Option<Arc<PoolBuffer>> {
        self.buffers
            .read()
            .get(token.buffer_index() as usize)
            .and_then(|slot| slot.clone())
    }

    /// Wake blocked renters with `PoolClosed` and refuse new rents
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_id: self.pool_id,
            segment_length: self.segment_length as usize,
            capacity: self.capacity.load(Ordering::Relaxed),
            available: self.permits.available(),
            in_use: self.in_use.load(Ordering::Relaxed),
            buffers: self.buffers.read().iter().filter(|slot| slot.is_some()).count(),
        }
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("stats", &self.stats())
            .finish()
    }
}
