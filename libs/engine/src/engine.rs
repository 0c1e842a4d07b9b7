//! Messaging Engine
//!
//! Wires pools, ring, sessions and the three worker threads together and
//! exposes the upward API through a cloneable [`EngineHandle`].
//!
//! ```text
//!  producers ──send──▶ ring ──▶ request-processor ──submit/commit──▶ facility
//!                                                                      │
//!  handler ◀──on_message── recv-completions ◀──────poll────────────────┤
//!                          send-completions ◀──────poll────────────────┘
//! ```

use crate::buffers::{PoolSet, PoolStats, SegmentPool, SegmentToken, RECEIVE_POOL_ID, SEND_POOL_ID};
use crate::facility::{Facility, SocketHandle};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::processing::{
    CompletionProcessor, ReceiveCompletionHandler, RequestEntry, RequestProcessor, RequestRing,
    RingConsumer, SendCompletionHandler,
};
use crate::protocol::{frame_len, write_frame_header, FRAME_HEADER_LEN};
use crate::session::{Session, SessionHandler, SessionId, SessionInfo, SessionManager};
use crate::sync::CancellationToken;
use crate::{EngineError, Result};
use engine_config::EngineConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub facility: Arc<dyn Facility>,
    pub pools: PoolSet,
    pub ring: Arc<RequestRing>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<EngineMetrics>,
    pub token: CancellationToken,
    fatal: Mutex<Option<EngineError>>,
}

impl EngineShared {
    /// Record the first fatal error and stop the engine
    pub fn fail(&self, error: EngineError) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(error);
            }
        }
        self.token.cancel();
    }
}

/// Cheap, cloneable access to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) shared: Arc<EngineShared>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("running", &self.is_running())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

impl EngineHandle {
    /// Build every shared component without starting any thread
    pub(crate) fn build(
        config: EngineConfig,
        facility: Arc<dyn Facility>,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<(Self, RingConsumer)> {
        config
            .validate()
            .map_err(|e| EngineError::configuration(e.to_string(), None))?;

        let pools = PoolSet::new(
            SegmentPool::new(SEND_POOL_ID, &config.send_pool, facility.clone())?,
            SegmentPool::new(RECEIVE_POOL_ID, &config.receive_pool, facility.clone())?,
        );
        let (ring, consumer) = RequestRing::new(&config.ring)?;
        let metrics = Arc::new(EngineMetrics::new());
        let sessions = Arc::new(SessionManager::new(
            &config,
            facility.clone(),
            pools.clone(),
            handler,
            metrics.clone(),
        ));

        let token = CancellationToken::new();
        {
            let pools = pools.clone();
            token.on_cancel(move || pools.close());
        }

        let shared = Arc::new(EngineShared {
            config,
            facility,
            pools,
            ring,
            sessions,
            metrics,
            token,
            fatal: Mutex::new(None),
        });
        Ok((Self { shared }, consumer))
    }

    pub fn is_running(&self) -> bool {
        !self.shared.token.is_cancelled()
    }

    /// The error that stopped the engine, if any
    pub fn fatal_error(&self) -> Option<EngineError> {
        self.shared.fatal.lock().clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::Shutdown)
        }
    }

    fn active_session(&self, session_id: SessionId) -> Result<Arc<Session>> {
        self.shared
            .sessions
            .try_get(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))
    }

    // Sessions

    /// Reserve a session for a connection about to be opened
    pub fn acquire_session(&self) -> Result<SessionId> {
        self.ensure_running()?;
        Ok(self.shared.sessions.acquire()?.id())
    }

    /// Bind an acquired session to a connected socket and post its receives
    pub fn open_session(&self, session_id: SessionId, socket: SocketHandle) -> Result<()> {
        self.ensure_running()?;
        let sessions = &self.shared.sessions;
        let session = sessions
            .session(session_id)
            .cloned()
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        sessions.open(&session, socket)?;

        let generation = session.generation();
        for token in session.receive_tokens() {
            if let Err(e) = self
                .shared
                .ring
                .publish(RequestEntry::receive(session_id, generation, token))
            {
                warn!(session_id, error = %e, "Could not post initial receives");
                sessions.close(&session);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close a session if open and return it to the pool once drained
    pub fn release_session(&self, session_id: SessionId) -> Result<()> {
        let session = self
            .shared
            .sessions
            .session(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        self.shared.sessions.release(session);
        Ok(())
    }

    /// Close an active session; false when it was not active
    pub fn close_session(&self, session_id: SessionId) -> bool {
        self.shared
            .sessions
            .try_get(session_id)
            .is_some_and(|session| self.shared.sessions.close(&session))
    }

    pub fn try_get_session(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.shared.sessions.try_get(session_id).map(|s| s.info())
    }

    pub fn try_get_session_by_peer(&self, peer_id: &str) -> Option<SessionInfo> {
        self.shared
            .sessions
            .try_get_by_peer(peer_id)
            .map(|s| s.info())
    }

    /// Associate a peer id with an active session, usually after a handshake
    pub fn bind_peer(&self, session_id: SessionId, peer_id: &str) -> Result<()> {
        let session = self.active_session(session_id)?;
        self.shared.sessions.bind_peer(&session, peer_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.active_count()
    }

    // Traffic

    /// Frame `payload` and queue it for the session. An empty payload goes
    /// out as a keep-alive frame.
    pub fn send(&self, session_id: SessionId, payload: &[u8]) -> Result<()> {
        self.send_with(session_id, payload.len(), |body| {
            body.copy_from_slice(payload);
            payload.len()
        })
    }

    /// Queue a frame whose body is written in place by `write`. `write` gets
    /// exactly `max_len` bytes and returns how many it used. With conflation
    /// on, the frame is then copied into the session's pending send segment
    /// when it fits.
    pub fn send_with<F>(&self, session_id: SessionId, max_len: usize, write: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        self.ensure_running()?;
        let shared = &*self.shared;
        let session = self.active_session(session_id)?;
        let needed = frame_len(max_len);
        let segment_length = shared.pools.send().segment_length();
        if needed > segment_length {
            return Err(EngineError::protocol(format!(
                "frame of {} bytes exceeds the {} byte send segment",
                needed, segment_length
            )));
        }
        let generation = session.generation();
        let conflation = &shared.config.conflation;

        // `write` runs before any lock is taken so it may call back into the
        // engine
        let mut segment = shared.pools.send().rent()?;
        let written = write_frame(segment.spare_mut(), max_len, write);
        segment.set_len(written);

        if conflation.enabled {
            let mut guard = session.conflation.lock();
            let pending = &mut *guard;
            if let Some(target) = pending.segment.as_mut() {
                if pending.messages < conflation.max_conflation_count
                    && session.generation() == generation
                    && target.append(segment.as_slice())
                {
                    pending.messages += 1;
                    drop(guard);
                    shared.pools.release(segment);
                    shared.metrics.record_conflated_messages(1);
                    shared.metrics.record_messages_sent(1);
                    return Ok(());
                }
            }
        }

        // Claim before taking the conflation lock
        let mut claim = match shared.ring.claim() {
            Ok(claim) => claim,
            Err(e) => {
                shared.pools.release(segment);
                return Err(e);
            }
        };

        let mut entry = RequestEntry::send(session_id, generation, segment);
        if conflation.enabled {
            let mut pending = session.conflation.lock();
            if pending.segment.is_none() {
                if session.generation() == generation {
                    pending.segment = entry.segment.take();
                    pending.messages = 1;
                    entry = RequestEntry::conflated_send(session_id, generation);
                }
            } else {
                // Later frames must not overtake this one through the
                // occupied segment
                pending.messages = conflation.max_conflation_count;
            }
        }
        *claim = entry;
        claim.publish();
        shared.metrics.record_messages_sent(1);
        Ok(())
    }

    /// Send to the session bound to `peer_id`
    pub fn send_to_peer(&self, peer_id: &str, payload: &[u8]) -> Result<()> {
        let session = self
            .shared
            .sessions
            .try_get_by_peer(peer_id)
            .ok_or_else(|| EngineError::session_not_found(peer_id))?;
        self.send(session.id(), payload)
    }

    /// Post the session's receive segment `token` again
    pub fn request_receive(&self, session_id: SessionId, token: SegmentToken) -> Result<()> {
        self.ensure_running()?;
        let session = self.active_session(session_id)?;
        self.shared
            .ring
            .publish(RequestEntry::receive(session_id, session.generation(), token))
    }

    pub(crate) fn request_receive_at(
        &self,
        session_id: SessionId,
        generation: u32,
        token: SegmentToken,
    ) -> Result<()> {
        self.shared
            .ring
            .publish(RequestEntry::receive(session_id, generation, token))
    }

    // Introspection

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn send_pool_stats(&self) -> PoolStats {
        self.shared.pools.send().stats()
    }

    pub fn receive_pool_stats(&self) -> PoolStats {
        self.shared.pools.receive().stats()
    }
}

/// Write a frame header plus the body produced by `write` into `spare`
fn write_frame<F>(spare: &mut [u8], max_len: usize, write: F) -> usize
where
    F: FnOnce(&mut [u8]) -> usize,
{
    let body = &mut spare[FRAME_HEADER_LEN..FRAME_HEADER_LEN + max_len];
    let len = write(body).min(max_len);
    write_frame_header(spare, len as u32);
    FRAME_HEADER_LEN + len
}

/// A running engine and its worker threads
pub struct MessagingEngine {
    handle: EngineHandle,
    workers: Vec<JoinHandle<()>>,
}

impl MessagingEngine {
    /// Validate `config`, build the engine and start its worker threads
    pub fn start(
        config: EngineConfig,
        facility: Arc<dyn Facility>,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        let (handle, consumer) = EngineHandle::build(config, facility, handler)?;
        let mut engine = Self {
            handle,
            workers: Vec::with_capacity(3),
        };
        let shared = engine.handle.shared.clone();
        let config = &shared.config;

        let processor = RequestProcessor::new(
            consumer,
            shared.sessions.clone(),
            shared.pools.clone(),
            shared.facility.clone(),
            config.batching.clone(),
            shared.metrics.clone(),
        );
        let token = shared.token.clone();
        let strategy = config.ring.wait_strategy;
        engine.spawn("request-processor", move || processor.run(&token, strategy))?;

        let receives = CompletionProcessor::new(
            shared.facility.clone(),
            ReceiveCompletionHandler::new(engine.handle.clone()),
            config.completions.max_completion_results,
            config.completions.receive_wait_strategy,
        );
        let owner = shared.clone();
        engine.spawn("recv-completions", move || {
            if let Err(e) = receives.run(&owner.token) {
                owner.fail(e);
            }
        })?;

        let sends = CompletionProcessor::new(
            shared.facility.clone(),
            SendCompletionHandler::new(
                shared.sessions.clone(),
                shared.pools.clone(),
                shared.metrics.clone(),
            ),
            config.completions.max_completion_results,
            config.completions.send_wait_strategy,
        );
        let owner = shared.clone();
        engine.spawn("send-completions", move || {
            if let Err(e) = sends.run(&owner.token) {
                owner.fail(e);
            }
        })?;

        info!(
            sessions = config.sessions.count,
            send_segments = config.send_pool.segment_count,
            receive_segments = config.receive_pool.segment_count,
            batching = config.batching.enabled,
            conflation = config.conflation.enabled,
            "Messaging engine started"
        );
        Ok(engine)
    }

    fn spawn<F>(&mut self, name: &str, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = thread::Builder::new().name(name.to_string()).spawn(work)?;
        self.workers.push(worker);
        Ok(())
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Stop the workers and close every session. Returns the fatal error
    /// that stopped the engine early, if any.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let shared = &self.handle.shared;
        shared.token.cancel();
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!(thread = %name, "Engine worker panicked");
            }
        }
        shared.sessions.close_all();

        let metrics = shared.metrics.snapshot();
        info!(
            messages_sent = metrics.messages_sent,
            messages_received = metrics.messages_received,
            sessions_opened = metrics.sessions_opened,
            "Messaging engine stopped"
        );
        match self.handle.fatal_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::ops::Deref for MessagingEngine {
    type Target = EngineHandle;

    fn deref(&self) -> &EngineHandle {
        &self.handle
    }
}

impl Drop for MessagingEngine {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Engine stopped after a fatal error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facility::recording::RecordingFacility;
    use crate::facility::{CompletionQueueKind, CompletionResult};
    use crate::session::ReceivedMessage;
    use engine_config::{PoolConfig, WaitStrategy};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Collector {
        reply: bool,
        messages: Mutex<Vec<(SessionId, Vec<u8>)>>,
        closed: Mutex<Vec<SessionId>>,
    }

    impl SessionHandler for Collector {
        fn on_message(&self, message: &ReceivedMessage<'_>) {
            self.messages
                .lock()
                .push((message.session_id, message.payload.to_vec()));
            if self.reply {
                message
                    .engine
                    .send(message.session_id, message.payload)
                    .unwrap();
            }
        }

        fn on_closed(&self, session_id: SessionId, _peer_id: Option<&str>) {
            self.closed.lock().push(session_id);
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.sessions.count = 2;
        config.sessions.max_outstanding_receives = 2;
        config.send_pool = PoolConfig {
            segment_length: 128,
            segment_count: 16,
            acquire_timeout_ms: 10,
        };
        config.receive_pool = PoolConfig {
            segment_length: 128,
            segment_count: 8,
            acquire_timeout_ms: 10,
        };
        config.ring.capacity = 64;
        config.max_frame_length = 256;
        config.completions.max_completion_results = 16;
        config
    }

    /// Engine whose worker loops are stepped by the test
    struct Harness {
        handle: EngineHandle,
        requests: RequestProcessor,
        receives: CompletionProcessor<ReceiveCompletionHandler>,
        sends: CompletionProcessor<SendCompletionHandler>,
        facility: Arc<RecordingFacility>,
        collector: Arc<Collector>,
    }

    fn harness_with(config: EngineConfig, collector: Collector) -> Harness {
        let facility = Arc::new(RecordingFacility::new());
        let collector = Arc::new(collector);
        let (handle, consumer) =
            EngineHandle::build(config, facility.clone(), collector.clone()).unwrap();
        let shared = handle.shared.clone();
        let requests = RequestProcessor::new(
            consumer,
            shared.sessions.clone(),
            shared.pools.clone(),
            shared.facility.clone(),
            shared.config.batching.clone(),
            shared.metrics.clone(),
        );
        let receives = CompletionProcessor::new(
            shared.facility.clone(),
            ReceiveCompletionHandler::new(handle.clone()),
            16,
            WaitStrategy::BusySpin,
        );
        let sends = CompletionProcessor::new(
            shared.facility.clone(),
            SendCompletionHandler::new(
                shared.sessions.clone(),
                shared.pools.clone(),
                shared.metrics.clone(),
            ),
            16,
            WaitStrategy::BusySpin,
        );
        Harness {
            handle,
            requests,
            receives,
            sends,
            facility,
            collector,
        }
    }

    fn harness() -> Harness {
        harness_with(config(), Collector::default())
    }

    impl Harness {
        fn step(&mut self) {
            self.requests.process_available();
            self.receives.poll_once().unwrap();
            self.sends.poll_once().unwrap();
            self.requests.process_available();
        }

        fn open(&mut self, socket: u64) -> SessionId {
            let id = self.handle.acquire_session().unwrap();
            self.handle.open_session(id, SocketHandle(socket)).unwrap();
            self.step();
            id
        }

        fn received(&self) -> Vec<Vec<u8>> {
            self.collector
                .messages
                .lock()
                .iter()
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_open_session_posts_receives() {
        let mut h = harness();
        let id = h.open(1);
        assert_eq!(h.facility.pending_receives().len(), 2);
        assert_eq!(h.handle.try_get_session(id).unwrap().session_id, id);
        assert_eq!(h.handle.receive_pool_stats().in_use, 2);
    }

    #[test]
    fn test_receive_delivers_messages_and_reposts() {
        let mut h = harness();
        h.open(1);
        let token = h.facility.pending_receives()[0];
        let mut data = frame(b"hello");
        data.extend_from_slice(&frame(b"world"));
        assert!(h.facility.deliver(token, &data));

        h.step();
        assert_eq!(h.received(), vec![b"hello".to_vec(), b"world".to_vec()]);
        // Same segment posted again
        assert_eq!(h.facility.pending_receives().len(), 2);
        assert!(h.facility.pending_receives().contains(&token));
        assert_eq!(h.handle.metrics().messages_received, 2);
        assert_eq!(h.handle.metrics().bytes_received, data.len() as u64);
    }

    #[test]
    fn test_frame_split_across_receives() {
        let mut h = harness();
        h.open(1);
        let data = frame(b"split across two segments");
        let (first, second) = data.split_at(3);

        let token = h.facility.pending_receives()[0];
        h.facility.deliver(token, first);
        h.step();
        assert!(h.received().is_empty());

        let token = h.facility.pending_receives()[0];
        h.facility.deliver(token, second);
        h.step();
        assert_eq!(h.received(), vec![b"split across two segments".to_vec()]);
    }

    #[test]
    fn test_padding_frames_are_absorbed() {
        let mut h = harness();
        h.open(1);
        let mut data = crate::protocol::padding_frame().to_vec();
        data.extend_from_slice(&frame(b"after padding"));
        let token = h.facility.pending_receives()[0];
        h.facility.deliver(token, &data);
        h.step();
        assert_eq!(h.received(), vec![b"after padding".to_vec()]);
    }

    #[test]
    fn test_zero_byte_receive_closes_and_recycles_session() {
        let mut h = harness();
        let id = h.open(1);
        let token = h.facility.pending_receives()[0];
        assert!(h.facility.complete(token, 0));

        h.step();
        h.step();
        assert_eq!(*h.collector.closed.lock(), vec![id]);
        assert!(h.handle.try_get_session(id).is_none());
        assert_eq!(h.handle.metrics().disconnects, 1);
        // The aborted second receive came back stale and the session drained
        assert_eq!(h.handle.shared.sessions.available(), 2);
        assert_eq!(h.handle.receive_pool_stats().in_use, 0);
    }

    #[test]
    fn test_completions_after_close_are_ignored() {
        let mut h = harness();
        let id = h.open(1);
        assert!(h.handle.close_session(id));
        assert!(!h.handle.close_session(id));

        h.step();
        assert_eq!(h.collector.closed.lock().len(), 1);
        assert_eq!(h.handle.metrics().stale_completions, 2);
        assert!(h.received().is_empty());
        assert_eq!(h.handle.shared.sessions.available(), 2);
    }

    #[test]
    fn test_unknown_token_is_stale() {
        let mut h = harness();
        h.open(1);
        h.facility.push_completion(
            CompletionQueueKind::Receive,
            CompletionResult {
                session_correlation: 0,
                request_correlation: SegmentToken::new(1, 5, 0).as_raw(),
                bytes_transferred: 12,
            },
        );
        h.step();
        assert_eq!(h.handle.metrics().stale_completions, 1);
        assert_eq!(h.facility.pending_receives().len(), 2);
    }

    #[test]
    fn test_oversized_frame_closes_session() {
        let mut h = harness();
        let id = h.open(1);
        let token = h.facility.pending_receives()[0];
        h.facility.deliver(token, &1000u32.to_le_bytes());

        h.step();
        assert!(h.handle.try_get_session(id).is_none());
        assert_eq!(h.handle.metrics().protocol_violations, 1);
    }

    #[test]
    fn test_send_completion_returns_segment() {
        let mut h = harness();
        let id = h.open(1);
        h.handle.send(id, b"ping").unwrap();
        h.step();

        let sends = h.facility.submissions_of(CompletionQueueKind::Send);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].bytes, frame(b"ping"));
        assert_eq!(h.handle.send_pool_stats().in_use, 1);

        h.facility.complete(sends[0].token, sends[0].bytes.len() as u32);
        h.step();
        assert_eq!(h.handle.send_pool_stats().in_use, 0);
        assert_eq!(h.handle.metrics().bytes_sent, 8);
    }

    #[test]
    fn test_failed_send_completion_closes_session() {
        let mut h = harness();
        let id = h.open(1);
        h.handle.send(id, b"lost").unwrap();
        h.step();

        let token = h.facility.submissions_of(CompletionQueueKind::Send)[0].token;
        h.facility.complete(token, 0);
        h.step();
        assert!(h.handle.try_get_session(id).is_none());
        assert_eq!(h.handle.send_pool_stats().in_use, 0);
    }

    #[test]
    fn test_conflation_merges_pending_sends() {
        let mut config = config();
        config.conflation.enabled = true;
        config.conflation.max_conflation_count = 8;
        let mut h = harness_with(config, Collector::default());
        let id = h.open(1);

        for body in [b"a".as_slice(), b"b", b"c"] {
            h.handle.send(id, body).unwrap();
        }
        h.step();

        let sends = h.facility.submissions_of(CompletionQueueKind::Send);
        assert_eq!(sends.len(), 1);
        let mut expected = frame(b"a");
        expected.extend_from_slice(&frame(b"b"));
        expected.extend_from_slice(&frame(b"c"));
        assert_eq!(sends[0].bytes, expected);
        assert_eq!(h.handle.metrics().conflated_messages, 2);
        assert_eq!(h.handle.send_pool_stats().in_use, 1);
    }

    #[test]
    fn test_conflation_count_limit() {
        let mut config = config();
        config.conflation.enabled = true;
        config.conflation.max_conflation_count = 2;
        config.batching.enabled = false;
        let mut h = harness_with(config, Collector::default());
        let id = h.open(1);

        for body in [b"1".as_slice(), b"2", b"3"] {
            h.handle.send(id, body).unwrap();
        }
        h.step();

        let sends = h.facility.submissions_of(CompletionQueueKind::Send);
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[1].bytes, frame(b"3"));
    }

    #[test]
    fn test_send_with_may_send_from_its_writer() {
        let mut config = config();
        config.conflation.enabled = true;
        let mut h = harness_with(config, Collector::default());
        let id = h.open(1);
        h.handle.send(id, b"first").unwrap();

        let handle = h.handle.clone();
        h.handle
            .send_with(id, 8, |body| {
                handle.send(id, b"inner").unwrap();
                body[..5].copy_from_slice(b"outer");
                5
            })
            .unwrap();
        h.step();

        let sends = h.facility.submissions_of(CompletionQueueKind::Send);
        assert_eq!(sends.len(), 1);
        let mut expected = frame(b"first");
        expected.extend_from_slice(&frame(b"inner"));
        expected.extend_from_slice(&frame(b"outer"));
        assert_eq!(sends[0].bytes, expected);
        // Copies merged into the pending segment went straight back
        assert_eq!(h.handle.send_pool_stats().in_use, 1);
    }

    #[test]
    fn test_reply_from_message_callback() {
        let mut h = harness_with(
            config(),
            Collector {
                reply: true,
                ..Collector::default()
            },
        );
        let id = h.open(1);
        let token = h.facility.pending_receives()[0];
        h.facility.deliver(token, &frame(b"echo me"));

        h.step();
        let sends = h.facility.submissions_of(CompletionQueueKind::Send);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].bytes, frame(b"echo me"));
        assert_eq!(h.collector.messages.lock()[0].0, id);
    }

    #[test]
    fn test_send_errors() {
        let h = harness();
        assert!(matches!(
            h.handle.send(1, b"nobody"),
            Err(EngineError::SessionNotFound { .. })
        ));

        let mut h = harness();
        let id = h.open(1);
        assert!(matches!(
            h.handle.send(id, &[0u8; 200]),
            Err(EngineError::Protocol { .. })
        ));
        assert!(matches!(
            h.handle.send_to_peer("ghost", b"x"),
            Err(EngineError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_send_to_bound_peer() {
        let mut h = harness();
        let id = h.open(1);
        h.handle.bind_peer(id, "venue-a").unwrap();
        assert_eq!(
            h.handle.try_get_session_by_peer("venue-a").unwrap().session_id,
            id
        );

        h.handle.send_to_peer("venue-a", b"routed").unwrap();
        h.step();
        let sends = h.facility.submissions_of(CompletionQueueKind::Send);
        assert_eq!(sends[0].bytes, frame(b"routed"));
    }

    #[test]
    fn test_send_with_writes_in_place() {
        let mut h = harness();
        let id = h.open(1);
        h.handle
            .send_with(id, 16, |body| {
                body[..3].copy_from_slice(b"abc");
                3
            })
            .unwrap();
        h.step();
        let sends = h.facility.submissions_of(CompletionQueueKind::Send);
        assert_eq!(sends[0].bytes, frame(b"abc"));
    }

    #[test]
    fn test_corrupted_completion_queue_is_fatal() {
        let mut h = harness();
        h.open(1);
        h.facility.corrupt();
        assert!(h.receives.poll_once().is_err());

        let token = CancellationToken::new();
        let result = h.sends.run(&token);
        assert!(matches!(result, Err(EngineError::FacilityFault { .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.ring.capacity = 48;
        let facility = Arc::new(RecordingFacility::new());
        let result = MessagingEngine::start(config, facility, Arc::new(Collector::default()));
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn test_facility_fault_stops_running_engine() {
        let facility = Arc::new(RecordingFacility::new());
        let engine =
            MessagingEngine::start(config(), facility.clone(), Arc::new(Collector::default()))
                .unwrap();
        assert!(engine.is_running());
        facility.corrupt();

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!engine.is_running());
        assert!(matches!(
            engine.acquire_session(),
            Err(EngineError::Shutdown)
        ));
        assert!(matches!(
            engine.shutdown(),
            Err(EngineError::FacilityFault { .. })
        ));
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let facility = Arc::new(RecordingFacility::new());
        let collector = Arc::new(Collector::default());
        let engine = MessagingEngine::start(config(), facility.clone(), collector.clone()).unwrap();
        let id = engine.acquire_session().unwrap();
        engine.open_session(id, SocketHandle(5)).unwrap();

        engine.shutdown().unwrap();
        assert_eq!(*collector.closed.lock(), vec![id]);
        assert_eq!(facility.closed_sockets(), vec![SocketHandle(5)]);
    }
}
