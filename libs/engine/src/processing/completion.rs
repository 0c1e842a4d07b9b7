//! Completion Processors
//!
//! One polling loop per completion queue. Each drains up to
//! `max_completion_results` per poll and idles with its wait strategy when
//! nothing arrived. A poll failure means the queue itself is broken: the
//! loop reports it and stops instead of retrying.

use crate::buffers::{PoolSet, SegmentToken};
use crate::engine::EngineHandle;
use crate::facility::{CompletionQueueKind, CompletionResult, Facility};
use crate::metrics::EngineMetrics;
use crate::session::{split_correlation, ReceivedMessage, SessionManager};
use crate::sync::{CancellationToken, IdleWaiter};
use crate::Result;
use engine_config::WaitStrategy;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reaction to completions of one queue kind
pub trait CompletionHandler: Send + 'static {
    const KIND: CompletionQueueKind;

    fn on_completion(&mut self, result: &CompletionResult);
}

pub struct CompletionProcessor<H> {
    facility: Arc<dyn Facility>,
    handler: H,
    results: Box<[CompletionResult]>,
    strategy: WaitStrategy,
}

impl<H: CompletionHandler> CompletionProcessor<H> {
    pub fn new(
        facility: Arc<dyn Facility>,
        handler: H,
        max_completion_results: usize,
        strategy: WaitStrategy,
    ) -> Self {
        Self {
            facility,
            handler,
            results: vec![CompletionResult::default(); max_completion_results.max(1)]
                .into_boxed_slice(),
            strategy,
        }
    }

    /// Poll once and dispatch whatever arrived
    pub fn poll_once(&mut self) -> Result<usize> {
        let count = self.facility.poll_completions(H::KIND, &mut self.results)?;
        for result in &self.results[..count] {
            self.handler.on_completion(result);
        }
        Ok(count)
    }

    /// Poll until `token` is cancelled or the completion queue fails
    pub fn run(mut self, token: &CancellationToken) -> Result<()> {
        let queue = H::KIND.as_str();
        info!(queue, batch = self.results.len(), "Completion processor started");
        let mut waiter = IdleWaiter::new(self.strategy);
        while !token.is_cancelled() {
            match self.poll_once() {
                Ok(0) => waiter.idle(),
                Ok(_) => waiter.reset(),
                Err(e) => {
                    error!(queue, error = %e, "Completion queue failed, stopping engine");
                    return Err(e);
                }
            }
        }
        info!(queue, "Completion processor stopped");
        Ok(())
    }
}

/// Frames received bytes, raises messages and re-posts the segment
pub struct ReceiveCompletionHandler {
    engine: EngineHandle,
}

impl ReceiveCompletionHandler {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

impl CompletionHandler for ReceiveCompletionHandler {
    const KIND: CompletionQueueKind = CompletionQueueKind::Receive;

    fn on_completion(&mut self, result: &CompletionResult) {
        let shared = &*self.engine.shared;
        let token = SegmentToken::from_raw(result.request_correlation);
        let Some(mut segment) = shared.pools.reclaim(token) else {
            shared.metrics.record_stale_completions(1);
            debug!(token = %token, "Receive completion for a segment not in flight");
            return;
        };
        let (session_id, generation) = split_correlation(result.session_correlation);
        let Some(session) = shared.sessions.session(session_id) else {
            shared.pools.release(segment);
            shared.metrics.record_stale_completions(1);
            warn!(session_id, "Receive completion for unknown session");
            return;
        };

        if !session.is_current(generation) {
            shared.pools.release(segment);
            shared.metrics.record_stale_completions(1);
            shared.sessions.complete_op(session);
            return;
        }

        if result.bytes_transferred == 0 {
            shared.pools.release(segment);
            shared.metrics.record_disconnects(1);
            debug!(session_id, "Peer closed connection");
            shared.sessions.close(session);
            shared.sessions.complete_op(session);
            return;
        }

        let received = (result.bytes_transferred as usize).min(segment.capacity());
        segment.set_len(received);
        shared.metrics.record_bytes_received(received as u64);

        let peer = session.peer_id();
        let handler = shared.sessions.handler();
        let engine = &self.engine;
        let framed = session.framer.lock().submit_bytes(segment.as_slice(), |payload| {
            handler.on_message(&ReceivedMessage {
                session_id,
                peer_id: peer.as_deref(),
                payload,
                engine,
            });
        });

        match framed {
            Ok(messages) => shared.metrics.record_messages_received(messages as u64),
            Err(e) => {
                shared.pools.release(segment);
                shared.metrics.record_protocol_violations(1);
                warn!(session_id, error = %e, "Protocol violation, closing session");
                shared.sessions.close(session);
                shared.sessions.complete_op(session);
                return;
            }
        }

        match session.store_receive_segment(segment, generation) {
            Ok(()) => {
                if let Err(e) = self.engine.request_receive_at(session_id, generation, token) {
                    warn!(session_id, error = %e, "Could not re-post receive, closing session");
                    shared.sessions.close(session);
                }
            }
            // Closed by the handler while the bytes were being delivered
            Err(segment) => shared.pools.release(segment),
        }
        shared.sessions.complete_op(session);
    }
}

/// Returns sent segments to the pool
pub struct SendCompletionHandler {
    sessions: Arc<SessionManager>,
    pools: PoolSet,
    metrics: Arc<EngineMetrics>,
}

impl SendCompletionHandler {
    pub fn new(sessions: Arc<SessionManager>, pools: PoolSet, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            sessions,
            pools,
            metrics,
        }
    }
}

impl CompletionHandler for SendCompletionHandler {
    const KIND: CompletionQueueKind = CompletionQueueKind::Send;

    fn on_completion(&mut self, result: &CompletionResult) {
        let token = SegmentToken::from_raw(result.request_correlation);
        let Some(segment) = self.pools.reclaim(token) else {
            self.metrics.record_stale_completions(1);
            debug!(token = %token, "Send completion for a segment not in flight");
            return;
        };
        self.pools.release(segment);

        let (session_id, generation) = split_correlation(result.session_correlation);
        let Some(session) = self.sessions.session(session_id) else {
            warn!(session_id, "Send completion for unknown session");
            return;
        };
        if result.bytes_transferred == 0 {
            self.metrics.record_disconnects(1);
            if session.is_current(generation) {
                debug!(session_id, "Send failed, closing session");
                self.sessions.close(session);
            }
        } else {
            self.metrics
                .record_bytes_sent(result.bytes_transferred as u64);
        }
        self.sessions.complete_op(session);
    }
}
