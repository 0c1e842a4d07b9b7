//! Socket Facility Abstraction
//!
//! The engine never calls the operating system directly. It talks to a
//! completion-queue style socket facility through two traits:
//!
//! - [`RegisteredMemory`]: allocate and register page-aligned regions that
//!   back segment pools
//! - [`SocketIo`]: per-socket request queues that accept send and receive
//!   submissions, plus two completion queues (send and receive) that report
//!   finished operations
//!
//! Every submission carries a request correlation (the segment token) and
//! every request queue carries a session correlation. Completions echo both so
//! the engine can route a result back to its segment and session without any
//! lookup table.
//!
//! A completion with `bytes_transferred == 0` reports a disconnect or an
//! aborted operation.

use crate::Result;
use std::ptr::NonNull;

pub mod memory;
pub mod tcp;

#[cfg(test)]
pub(crate) mod recording;

pub use memory::{allocate_region, free_region, REGION_ALIGN};
pub use tcp::TcpFacility;

/// Registration id of a memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Facility handle for a connected socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub u64);

/// Facility handle for a socket's request queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestQueueId(pub u64);

/// Slice of a registered region handed to the facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub buffer_id: BufferId,
    pub offset: u32,
    pub length: u32,
}

/// One finished operation reported by a completion queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionResult {
    pub session_correlation: u64,
    pub request_correlation: u64,
    pub bytes_transferred: u32,
}

/// The two completion queues the facility exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionQueueKind {
    Send,
    Receive,
}

impl CompletionQueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionQueueKind::Send => "send",
            CompletionQueueKind::Receive => "receive",
        }
    }
}

/// Outstanding operation limits for a new request queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub max_outstanding_receives: usize,
    pub max_outstanding_sends: usize,
}

/// Owned pointer to an allocated memory region
#[derive(Debug)]
pub struct RegionHandle {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a region is plain memory; access is coordinated by segment ownership.
unsafe impl Send for RegionHandle {}
unsafe impl Sync for RegionHandle {}

impl RegionHandle {
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay valid until the handle is
    /// passed back to the `free` of the memory that produced it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Region allocation and registration
pub trait RegisteredMemory: Send + Sync {
    /// Allocate a zeroed, page-aligned region of `len` bytes
    fn allocate(&self, len: usize) -> Result<RegionHandle>;

    /// Register a region for socket I/O
    fn register(&self, region: &RegionHandle) -> Result<BufferId>;

    /// Drop a registration; the region itself stays allocated
    fn deregister(&self, buffer_id: BufferId) -> Result<()>;

    /// Release a region returned by `allocate`
    fn free(&self, region: RegionHandle);
}

/// Request queues and completion queues
pub trait SocketIo: Send + Sync {
    /// Create the request queue for a socket, tagging its completions with
    /// `session_correlation`
    fn create_request_queue(
        &self,
        socket: SocketHandle,
        session_correlation: u64,
        depth: QueueDepth,
    ) -> Result<RequestQueueId>;

    /// Queue a send; with `flush == false` the facility may hold it until the
    /// next flushed submission or `commit`
    fn submit_send(
        &self,
        queue: RequestQueueId,
        buffer: BufferDescriptor,
        request_correlation: u64,
        flush: bool,
    ) -> Result<()>;

    /// Post a receive buffer
    fn submit_receive(
        &self,
        queue: RequestQueueId,
        buffer: BufferDescriptor,
        request_correlation: u64,
        flush: bool,
    ) -> Result<()>;

    /// Flush every deferred submission of `kind` on `queue`
    fn commit(&self, queue: RequestQueueId, kind: CompletionQueueKind) -> Result<()>;

    /// Drain up to `results.len()` completions, returning how many were written
    fn poll_completions(
        &self,
        kind: CompletionQueueKind,
        results: &mut [CompletionResult],
    ) -> Result<usize>;

    /// Close a socket; every operation still posted on its request queue
    /// completes with zero bytes
    fn close_socket(&self, socket: SocketHandle) -> Result<()>;
}

/// Everything the engine needs from the platform
pub trait Facility: RegisteredMemory + SocketIo {}

impl<T: RegisteredMemory + SocketIo> Facility for T {}
