//! TCP Socket Facility
//!
//! Portable facility over non-blocking `std::net::TcpStream`s. Request queues
//! and completion queues are emulated in user space:
//!
//! - sends are written when flushed (or committed) and reported on the send
//!   completion queue once fully written
//! - posted receives are filled by non-blocking reads performed while the
//!   receive completion queue is polled
//! - closing a socket completes everything still posted with zero bytes
//!
//! Send and receive state of a queue sit behind separate locks so a writer
//! stalled on a full socket buffer never blocks the receive poller.

use super::{
    allocate_region, free_region, BufferDescriptor, BufferId, CompletionQueueKind,
    CompletionResult, QueueDepth, RegionHandle, RegisteredMemory, RequestQueueId, SocketHandle,
    SocketIo,
};
use crate::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a flush keeps retrying a socket whose send buffer is full
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct RegisteredRegion {
    base: usize,
    len: usize,
}

/// Connected socket owned by the facility
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    connected_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// TCP connection statistics
#[derive(Debug, Clone)]
pub struct TcpConnectionStats {
    pub peer_addr: SocketAddr,
    pub connected_duration: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingOp {
    buffer: BufferDescriptor,
    correlation: u64,
}

struct RequestQueue {
    socket: SocketHandle,
    connection: Arc<TcpConnection>,
    session_correlation: u64,
    depth: QueueDepth,
    closed: AtomicBool,
    sends: Mutex<VecDeque<PendingOp>>,
    receives: Mutex<VecDeque<PendingOp>>,
}

impl RequestQueue {
    fn completion(&self, op: &PendingOp, bytes_transferred: u32) -> CompletionResult {
        CompletionResult {
            session_correlation: self.session_correlation,
            request_correlation: op.correlation,
            bytes_transferred,
        }
    }
}

pub struct TcpFacility {
    next_id: AtomicU64,
    regions: DashMap<BufferId, RegisteredRegion>,
    sockets: DashMap<SocketHandle, Arc<TcpConnection>>,
    queues: DashMap<RequestQueueId, Arc<RequestQueue>>,
    socket_queues: DashMap<SocketHandle, RequestQueueId>,
    send_completions: Mutex<VecDeque<CompletionResult>>,
    receive_completions: Mutex<VecDeque<CompletionResult>>,
    corrupted: AtomicBool,
}

impl Default for TcpFacility {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpFacility {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            regions: DashMap::new(),
            sockets: DashMap::new(),
            queues: DashMap::new(),
            socket_queues: DashMap::new(),
            send_completions: Mutex::new(VecDeque::new()),
            receive_completions: Mutex::new(VecDeque::new()),
            corrupted: AtomicBool::new(false),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Take ownership of a connected stream
    pub fn adopt(&self, stream: TcpStream) -> Result<SocketHandle> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let handle = SocketHandle(self.next_id());
        self.sockets.insert(
            handle,
            Arc::new(TcpConnection {
                stream,
                peer_addr,
                connected_at: Instant::now(),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        );
        info!(socket = handle.0, peer = %peer_addr, "Adopted TCP connection");
        Ok(handle)
    }

    pub fn connection_stats(&self, socket: SocketHandle) -> Option<TcpConnectionStats> {
        self.sockets.get(&socket).map(|connection| TcpConnectionStats {
            peer_addr: connection.peer_addr,
            connected_duration: connection.connected_at.elapsed(),
            bytes_sent: connection.bytes_sent.load(Ordering::Relaxed),
            bytes_received: connection.bytes_received.load(Ordering::Relaxed),
        })
    }

    /// Make every later poll fail with a facility fault
    pub fn corrupt_completion_queues(&self) {
        warn!("Completion queues marked corrupted");
        self.corrupted.store(true, Ordering::Release);
    }

    fn queue(&self, queue: RequestQueueId) -> Result<Arc<RequestQueue>> {
        self.queues
            .get(&queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::facility(format!("request queue {} is closed", queue.0)))
    }

    /// Resolve a descriptor to raw memory after bounds checking it
    fn resolve(&self, buffer: &BufferDescriptor) -> Result<(*mut u8, usize)> {
        let region = self
            .regions
            .get(&buffer.buffer_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| {
                EngineError::facility(format!("buffer {} is not registered", buffer.buffer_id.0))
            })?;
        let end = buffer.offset as usize + buffer.length as usize;
        if end > region.len {
            return Err(EngineError::facility(format!(
                "descriptor {}..{} outside registered region of {} bytes",
                buffer.offset, end, region.len
            )));
        }
        Ok((
            (region.base + buffer.offset as usize) as *mut u8,
            buffer.length as usize,
        ))
    }

    /// Write every deferred send in order, reporting each on the send queue
    fn flush_sends(&self, queue: &RequestQueue, pending: &mut VecDeque<PendingOp>) {
        while let Some(op) = pending.pop_front() {
            let written = self.resolve(&op.buffer).and_then(|(ptr, len)| {
                // SAFETY: the segment is in flight, so the facility is its only user.
                let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
                write_all_nonblocking(&queue.connection.stream, bytes).map_err(EngineError::from)
            });

            let bytes_transferred = match written {
                Ok(()) => {
                    queue
                        .connection
                        .bytes_sent
                        .fetch_add(op.buffer.length as u64, Ordering::Relaxed);
                    op.buffer.length
                }
                Err(e) => {
                    debug!(
                        socket = queue.socket.0,
                        error = %e,
                        "Send failed, reporting zero-byte completion"
                    );
                    0
                }
            };
            self.send_completions
                .lock()
                .push_back(queue.completion(&op, bytes_transferred));
        }
    }

    fn submit(
        &self,
        kind: CompletionQueueKind,
        queue_id: RequestQueueId,
        buffer: BufferDescriptor,
        correlation: u64,
        flush: bool,
    ) -> Result<()> {
        self.resolve(&buffer)?;
        let queue = self.queue(queue_id)?;
        let op = PendingOp {
            buffer,
            correlation,
        };

        match kind {
            CompletionQueueKind::Send => {
                let mut sends = queue.sends.lock();
                if queue.closed.load(Ordering::Acquire) {
                    return Err(EngineError::facility(format!(
                        "request queue {} is closed",
                        queue_id.0
                    )));
                }
                if sends.len() >= queue.depth.max_outstanding_sends {
                    self.flush_sends(&queue, &mut sends);
                }
                sends.push_back(op);
                if flush {
                    self.flush_sends(&queue, &mut sends);
                }
            }
            CompletionQueueKind::Receive => {
                let mut receives = queue.receives.lock();
                if queue.closed.load(Ordering::Acquire) {
                    return Err(EngineError::facility(format!(
                        "request queue {} is closed",
                        queue_id.0
                    )));
                }
                if receives.len() >= queue.depth.max_outstanding_receives {
                    return Err(EngineError::backpressure(
                        format!("request queue {}", queue_id.0),
                        "too many outstanding receives",
                    ));
                }
                receives.push_back(op);
            }
        }
        Ok(())
    }

    /// Try one non-blocking read for the oldest posted receive of each queue
    fn poll_receives(&self, results: &mut [CompletionResult], mut count: usize) -> usize {
        for entry in self.queues.iter() {
            if count == results.len() {
                break;
            }
            let queue = entry.value();
            let Some(mut receives) = queue.receives.try_lock() else {
                continue;
            };
            if queue.closed.load(Ordering::Acquire) {
                continue;
            }
            let Some(op) = receives.front().copied() else {
                continue;
            };

            let outcome = self.resolve(&op.buffer).map(|(ptr, len)| {
                // SAFETY: the posted segment is in flight, so the facility is its only user.
                let buf = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
                (&queue.connection.stream).read(buf)
            });

            let bytes_transferred = match outcome {
                Ok(Ok(n)) => {
                    queue
                        .connection
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    if n == 0 {
                        debug!(socket = queue.socket.0, "Peer closed connection");
                    }
                    n as u32
                }
                Ok(Err(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Ok(Err(e)) => {
                    debug!(socket = queue.socket.0, error = %e, "Receive failed");
                    0
                }
                Err(e) => {
                    warn!(socket = queue.socket.0, error = %e, "Posted receive has a bad descriptor");
                    0
                }
            };

            receives.pop_front();
            results[count] = queue.completion(&op, bytes_transferred);
            count += 1;
        }
        count
    }
}

fn write_all_nonblocking(mut stream: &TcpStream, mut bytes: &[u8]) -> io::Result<()> {
    let mut stalled_since: Option<Instant> = None;
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                bytes = &bytes[n..];
                stalled_since = None;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() > WRITE_STALL_TIMEOUT {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn drain_into(
    source: &Mutex<VecDeque<CompletionResult>>,
    results: &mut [CompletionResult],
) -> usize {
    let mut source = source.lock();
    let count = source.len().min(results.len());
    for (slot, result) in results.iter_mut().zip(source.drain(..count)) {
        *slot = result;
    }
    count
}

impl RegisteredMemory for TcpFacility {
    fn allocate(&self, len: usize) -> Result<RegionHandle> {
        allocate_region(len)
    }

    fn register(&self, region: &RegionHandle) -> Result<BufferId> {
        let id = BufferId(self.next_id());
        self.regions.insert(
            id,
            RegisteredRegion {
                base: region.as_ptr() as usize,
                len: region.len(),
            },
        );
        debug!(buffer_id = id.0, len = region.len(), "Registered region");
        Ok(id)
    }

    fn deregister(&self, buffer_id: BufferId) -> Result<()> {
        self.regions
            .remove(&buffer_id)
            .map(|_| ())
            .ok_or_else(|| {
                EngineError::facility(format!("buffer {} is not registered", buffer_id.0))
            })
    }

    fn free(&self, region: RegionHandle) {
        free_region(region)
    }
}

impl SocketIo for TcpFacility {
    fn create_request_queue(
        &self,
        socket: SocketHandle,
        session_correlation: u64,
        depth: QueueDepth,
    ) -> Result<RequestQueueId> {
        let connection = self
            .sockets
            .get(&socket)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::facility(format!("unknown socket {}", socket.0)))?;

        let id = RequestQueueId(self.next_id());
        match self.socket_queues.entry(socket) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::facility(format!(
                    "socket {} already has a request queue",
                    socket.0
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        self.queues.insert(
            id,
            Arc::new(RequestQueue {
                socket,
                connection,
                session_correlation,
                depth,
                closed: AtomicBool::new(false),
                sends: Mutex::new(VecDeque::with_capacity(depth.max_outstanding_sends)),
                receives: Mutex::new(VecDeque::with_capacity(depth.max_outstanding_receives)),
            }),
        );
        Ok(id)
    }

    fn submit_send(
        &self,
        queue: RequestQueueId,
        buffer: BufferDescriptor,
        request_correlation: u64,
        flush: bool,
    ) -> Result<()> {
        self.submit(CompletionQueueKind::Send, queue, buffer, request_correlation, flush)
    }

    fn submit_receive(
        &self,
        queue: RequestQueueId,
        buffer: BufferDescriptor,
        request_correlation: u64,
        flush: bool,
    ) -> Result<()> {
        self.submit(CompletionQueueKind::Receive, queue, buffer, request_correlation, flush)
    }

    fn commit(&self, queue_id: RequestQueueId, kind: CompletionQueueKind) -> Result<()> {
        if kind == CompletionQueueKind::Receive {
            return Ok(());
        }
        let queue = self.queue(queue_id)?;
        let mut sends = queue.sends.lock();
        self.flush_sends(&queue, &mut sends);
        Ok(())
    }

    fn poll_completions(
        &self,
        kind: CompletionQueueKind,
        results: &mut [CompletionResult],
    ) -> Result<usize> {
        if self.corrupted.load(Ordering::Acquire) {
            return Err(EngineError::facility(format!(
                "{} completion queue is corrupted",
                kind.as_str()
            )));
        }
        match kind {
            CompletionQueueKind::Send => Ok(drain_into(&self.send_completions, results)),
            CompletionQueueKind::Receive => {
                let count = drain_into(&self.receive_completions, results);
                Ok(self.poll_receives(results, count))
            }
        }
    }

    fn close_socket(&self, socket: SocketHandle) -> Result<()> {
        if let Some((_, queue_id)) = self.socket_queues.remove(&socket) {
            if let Some((_, queue)) = self.queues.remove(&queue_id) {
                queue.closed.store(true, Ordering::Release);
                let _ = queue.connection.stream.shutdown(Shutdown::Both);

                let aborted_sends: Vec<_> = queue
                    .sends
                    .lock()
                    .drain(..)
                    .map(|op| queue.completion(&op, 0))
                    .collect();
                let aborted_receives: Vec<_> = queue
                    .receives
                    .lock()
                    .drain(..)
                    .map(|op| queue.completion(&op, 0))
                    .collect();
                debug!(
                    socket = socket.0,
                    sends = aborted_sends.len(),
                    receives = aborted_receives.len(),
                    "Aborted posted operations"
                );
                self.send_completions.lock().extend(aborted_sends);
                self.receive_completions.lock().extend(aborted_receives);
            }
        }

        match self.sockets.remove(&socket) {
            Some((_, connection)) => {
                let _ = connection.stream.shutdown(Shutdown::Both);
                info!(socket = socket.0, peer = %connection.peer_addr, "Closed TCP connection");
                Ok(())
            }
            None => Err(EngineError::facility(format!("unknown socket {}", socket.0))),
        }
    }
}
