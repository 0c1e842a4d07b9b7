//! In-memory facility that records submissions for unit tests

use super::{
    allocate_region, free_region, BufferDescriptor, BufferId, CompletionQueueKind,
    CompletionResult, QueueDepth, RegionHandle, RegisteredMemory, RequestQueueId, SocketHandle,
    SocketIo,
};
use crate::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub kind: CompletionQueueKind,
    pub queue: RequestQueueId,
    pub token: u64,
    pub flush: bool,
    pub descriptor: BufferDescriptor,
    /// Bytes of the descriptor at submission time
    pub bytes: Vec<u8>,
    pub pending: bool,
}

#[derive(Debug)]
struct QueueRecord {
    socket: SocketHandle,
    session_correlation: u64,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct RecordingFacility {
    next_id: AtomicU64,
    regions: Mutex<HashMap<BufferId, (usize, usize)>>,
    queues: Mutex<HashMap<RequestQueueId, QueueRecord>>,
    submissions: Mutex<Vec<Submission>>,
    commits: Mutex<Vec<(RequestQueueId, CompletionQueueKind)>>,
    send_completions: Mutex<VecDeque<CompletionResult>>,
    receive_completions: Mutex<VecDeque<CompletionResult>>,
    closed_sockets: Mutex<Vec<SocketHandle>>,
    fault: AtomicBool,
}

impl RecordingFacility {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn registered_regions(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn submissions_of(&self, kind: CompletionQueueKind) -> Vec<Submission> {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    pub fn commits(&self) -> Vec<(RequestQueueId, CompletionQueueKind)> {
        self.commits.lock().clone()
    }

    pub fn closed_sockets(&self) -> Vec<SocketHandle> {
        self.closed_sockets.lock().clone()
    }

    pub fn session_correlation(&self, queue: RequestQueueId) -> Option<u64> {
        self.queues.lock().get(&queue).map(|q| q.session_correlation)
    }

    /// Make every later poll fail as if the completion queue were corrupted
    pub fn corrupt(&self) {
        self.fault.store(true, Ordering::Release);
    }

    /// Queue a raw completion
    pub fn push_completion(&self, kind: CompletionQueueKind, result: CompletionResult) {
        self.completions(kind).lock().push_back(result);
    }

    /// Complete the pending submission with `token`, reporting `bytes`
    pub fn complete(&self, token: u64, bytes: u32) -> bool {
        let (kind, queue) = {
            let mut submissions = self.submissions.lock();
            let Some(submission) = submissions
                .iter_mut()
                .find(|s| s.token == token && s.pending)
            else {
                return false;
            };
            submission.pending = false;
            (submission.kind, submission.queue)
        };
        let session_correlation = self.session_correlation(queue).unwrap_or_default();
        self.push_completion(
            kind,
            CompletionResult {
                session_correlation,
                request_correlation: token,
                bytes_transferred: bytes,
            },
        );
        true
    }

    /// Write `data` into a posted receive and complete it
    pub fn deliver(&self, token: u64, data: &[u8]) -> bool {
        let descriptor = {
            let submissions = self.submissions.lock();
            match submissions
                .iter()
                .find(|s| s.token == token && s.pending && s.kind == CompletionQueueKind::Receive)
            {
                Some(s) => s.descriptor,
                None => return false,
            }
        };
        assert!(data.len() <= descriptor.length as usize);
        let (base, _) = self.regions.lock()[&descriptor.buffer_id];
        // SAFETY: the descriptor came from a registered region and the segment
        // is in flight, so nothing else touches it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (base as *mut u8).add(descriptor.offset as usize),
                data.len(),
            );
        }
        self.complete(token, data.len() as u32)
    }

    /// Pending receive tokens, oldest first
    pub fn pending_receives(&self) -> Vec<u64> {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.pending && s.kind == CompletionQueueKind::Receive)
            .map(|s| s.token)
            .collect()
    }

    fn completions(&self, kind: CompletionQueueKind) -> &Mutex<VecDeque<CompletionResult>> {
        match kind {
            CompletionQueueKind::Send => &self.send_completions,
            CompletionQueueKind::Receive => &self.receive_completions,
        }
    }

    fn record(
        &self,
        kind: CompletionQueueKind,
        queue: RequestQueueId,
        descriptor: BufferDescriptor,
        token: u64,
        flush: bool,
    ) -> Result<()> {
        if self.queues.lock().get(&queue).map_or(true, |q| q.closed) {
            return Err(EngineError::facility(format!("request queue {} closed", queue.0)));
        }
        let bytes = {
            let regions = self.regions.lock();
            let (base, len) = regions
                .get(&descriptor.buffer_id)
                .copied()
                .ok_or_else(|| EngineError::facility("unregistered buffer"))?;
            let end = descriptor.offset as usize + descriptor.length as usize;
            assert!(end <= len, "descriptor outside region");
            let length = match kind {
                CompletionQueueKind::Send => descriptor.length as usize,
                CompletionQueueKind::Receive => 0,
            };
            // SAFETY: range checked against the registered region above.
            unsafe {
                std::slice::from_raw_parts((base as *const u8).add(descriptor.offset as usize), length)
            }
            .to_vec()
        };
        self.submissions.lock().push(Submission {
            kind,
            queue,
            token,
            flush,
            descriptor,
            bytes,
            pending: true,
        });
        Ok(())
    }
}

impl RegisteredMemory for RecordingFacility {
    fn allocate(&self, len: usize) -> Result<RegionHandle> {
        allocate_region(len)
    }

    fn register(&self, region: &RegionHandle) -> Result<BufferId> {
        let id = BufferId(self.next());
        self.regions
            .lock()
            .insert(id, (region.as_ptr() as usize, region.len()));
        Ok(id)
    }

    fn deregister(&self, buffer_id: BufferId) -> Result<()> {
        self.regions
            .lock()
            .remove(&buffer_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::facility("unknown registration"))
    }

    fn free(&self, region: RegionHandle) {
        free_region(region)
    }
}

impl SocketIo for RecordingFacility {
    fn create_request_queue(
        &self,
        socket: SocketHandle,
        session_correlation: u64,
        _depth: QueueDepth,
    ) -> Result<RequestQueueId> {
        let id = RequestQueueId(self.next());
        self.queues.lock().insert(
            id,
            QueueRecord {
                socket,
                session_correlation,
                closed: false,
            },
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
        self.record(CompletionQueueKind::Send, queue, buffer, request_correlation, flush)
    }

    fn submit_receive(
        &self,
        queue: RequestQueueId,
        buffer: BufferDescriptor,
        request_correlation: u64,
        flush: bool,
    ) -> Result<()> {
        self.record(CompletionQueueKind::Receive, queue, buffer, request_correlation, flush)
    }

    fn commit(&self, queue: RequestQueueId, kind: CompletionQueueKind) -> Result<()> {
        self.commits.lock().push((queue, kind));
        Ok(())
    }

    fn poll_completions(
        &self,
        kind: CompletionQueueKind,
        results: &mut [CompletionResult],
    ) -> Result<usize> {
        if self.fault.load(Ordering::Acquire) {
            return Err(EngineError::facility("completion queue corrupted"));
        }
        let mut queue = self.completions(kind).lock();
        let mut count = 0;
        while count < results.len() {
            match queue.pop_front() {
                Some(result) => {
                    results[count] = result;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn close_socket(&self, socket: SocketHandle) -> Result<()> {
        self.closed_sockets.lock().push(socket);
        let closed: Vec<RequestQueueId> = {
            let mut queues = self.queues.lock();
            queues
                .iter_mut()
                .filter(|(_, q)| q.socket == socket && !q.closed)
                .map(|(id, q)| {
                    q.closed = true;
                    *id
                })
                .collect()
        };
        let aborted: Vec<u64> = self
            .submissions
            .lock()
            .iter()
            .filter(|s| s.pending && closed.contains(&s.queue))
            .map(|s| s.token)
            .collect();
        for token in aborted {
            self.complete(token, 0);
        }
        Ok(())
    }
}
