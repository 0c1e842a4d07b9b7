//! Per-session state shared between producers, the request processor and
//! the completion processors

use super::{session_correlation, SessionId, SessionInfo};
use crate::buffers::{Segment, SegmentToken};
use crate::facility::{RequestQueueId, SocketHandle};
use crate::protocol::MessageFramer;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum SessionState {
    Free = 0,
    Acquired = 1,
    Active = 2,
    /// Closed, waiting for in-flight operations to drain
    Closing = 3,
}

/// A receive segment owned by the session between posts
pub(crate) struct ReceiveSlot {
    token: AtomicU64,
    segment: spin::Mutex<Option<Segment>>,
}

/// Send segment that producers append frames to until the request processor
/// takes it
#[derive(Default)]
pub(crate) struct Conflation {
    pub segment: Option<Segment>,
    pub messages: usize,
}

pub struct Session {
    id: SessionId,
    generation: AtomicU32,
    state: AtomicU8,
    /// Submitted operations not yet completed, plus operations being prepared
    in_flight: AtomicU32,
    socket: AtomicU64,
    queue: AtomicU64,
    peer_id: RwLock<Option<Arc<str>>>,
    pub(crate) framer: Mutex<MessageFramer>,
    receive_slots: Box<[ReceiveSlot]>,
    pub(crate) conflation: spin::Mutex<Conflation>,
}

impl Session {
    pub(crate) fn new(id: SessionId, receive_slots: usize, max_frame_length: usize) -> Self {
        Self {
            id,
            generation: AtomicU32::new(0),
            state: AtomicU8::new(SessionState::Free.into()),
            in_flight: AtomicU32::new(0),
            socket: AtomicU64::new(0),
            queue: AtomicU64::new(0),
            peer_id: RwLock::new(None),
            framer: Mutex::new(MessageFramer::new(max_frame_length)),
            receive_slots: (0..receive_slots)
                .map(|_| ReceiveSlot {
                    token: AtomicU64::new(u64::MAX),
                    segment: spin::Mutex::new(None),
                })
                .collect(),
            conflation: spin::Mutex::new(Conflation::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Id and generation as carried by facility completions
    #[inline]
    pub fn correlation(&self) -> u64 {
        session_correlation(self.id, self.generation())
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        SessionState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::Free)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Active and still in the given generation
    #[inline]
    pub fn is_current(&self, generation: u32) -> bool {
        self.is_active() && self.generation() == generation
    }

    pub fn peer_id(&self) -> Option<Arc<str>> {
        self.peer_id.read().clone()
    }

    pub fn socket(&self) -> SocketHandle {
        SocketHandle(self.socket.load(Ordering::Acquire))
    }

    #[inline]
    pub fn queue(&self) -> RequestQueueId {
        RequestQueueId(self.queue.load(Ordering::Acquire))
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            generation: self.generation(),
            peer_id: self.peer_id().map(|peer| peer.to_string()),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Tokens of the receive segments assigned at open
    pub fn receive_tokens(&self) -> impl Iterator<Item = SegmentToken> + '_ {
        self.receive_slots
            .iter()
            .map(|slot| slot.token.load(Ordering::Acquire))
            .filter(|&raw| raw != u64::MAX)
            .map(SegmentToken::from_raw)
    }

    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub(crate) fn set_binding(&self, socket: SocketHandle, queue: RequestQueueId) {
        self.socket.store(socket.0, Ordering::Release);
        self.queue.store(queue.0, Ordering::Release);
    }

    pub(crate) fn set_peer_id(&self, peer: Option<Arc<str>>) -> Option<Arc<str>> {
        std::mem::replace(&mut *self.peer_id.write(), peer)
    }

    pub(crate) fn increment_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this was the last outstanding operation
    pub(crate) fn decrement_in_flight(&self) -> bool {
        self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn slot(&self, token: SegmentToken) -> Option<&ReceiveSlot> {
        self.receive_slots
            .iter()
            .find(|slot| slot.token.load(Ordering::Acquire) == token.as_raw())
    }

    /// Give a receive segment to the session, assigning it a slot
    pub(crate) fn assign_receive_segment(&self, index: usize, segment: Segment) {
        let slot = &self.receive_slots[index];
        slot.token.store(segment.token().as_raw(), Ordering::Release);
        *slot.segment.lock() = Some(segment);
    }

    /// Take a receive segment for posting, if the session is still in
    /// `generation`
    pub(crate) fn take_receive_segment(
        &self,
        token: SegmentToken,
        generation: u32,
    ) -> Option<Segment> {
        let slot = self.slot(token)?;
        let mut segment = slot.segment.lock();
        if !self.is_current(generation) {
            return None;
        }
        segment.take()
    }

    /// Put a completed receive segment back for the next post. Hands the
    /// segment back when the session moved on.
    pub(crate) fn store_receive_segment(
        &self,
        mut segment: Segment,
        generation: u32,
    ) -> Result<(), Segment> {
        let Some(slot) = self.slot(segment.token()) else {
            return Err(segment);
        };
        let mut stored = slot.segment.lock();
        if !self.is_current(generation) || stored.is_some() {
            return Err(segment);
        }
        segment.clear();
        *stored = Some(segment);
        Ok(())
    }

    /// Empty every receive slot, returning the segments found
    pub(crate) fn drain_receive_segments(&self) -> impl Iterator<Item = Segment> + '_ {
        self.receive_slots.iter().filter_map(|slot| {
            slot.token.store(u64::MAX, Ordering::Release);
            slot.segment.lock().take()
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}
