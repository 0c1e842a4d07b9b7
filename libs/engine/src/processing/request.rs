//! Request Processor
//!
//! The single consumer of the request ring. Every submission to a request
//! queue happens on this thread, which keeps per-session wire order equal to
//! ring order and lets batching and deferred flushes live in plain,
//! unsynchronised state.
//!
//! Sends of one session are coalesced into the first entry's segment while
//! they fit. Submissions are made with `flush == false` and committed at a
//! flush boundary: the end of a dequeue batch, or a session reaching the batch
//! ceiling. A boundary commits every session's pending submissions, not only
//! the session that triggered it.

use super::batch::{PendingFlushes, SendingBatch};
use super::entry::{Operation, RequestEntry};
use super::ring::RingConsumer;
use crate::buffers::{PoolSet, Segment};
use crate::facility::{CompletionQueueKind, Facility};
use crate::metrics::EngineMetrics;
use crate::session::{Session, SessionManager};
use crate::sync::{CancellationToken, IdleWaiter};
use engine_config::{BatchingConfig, WaitStrategy};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one pass over the ring did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub entries: usize,
    pub send_submissions: usize,
    pub receive_submissions: usize,
    /// Entries whose bytes were appended to another entry's segment
    pub batched: usize,
    pub expired: usize,
    pub commits: usize,
}

pub struct RequestProcessor {
    consumer: RingConsumer,
    dispatcher: Dispatcher,
    max_drain: usize,
}

struct Dispatcher {
    sessions: Arc<SessionManager>,
    pools: PoolSet,
    facility: Arc<dyn Facility>,
    batching: BatchingConfig,
    /// Indexed by session id
    batches: Vec<SendingBatch>,
    open_batches: Vec<usize>,
    pending: PendingFlushes,
    metrics: Arc<EngineMetrics>,
}

impl RequestProcessor {
    pub fn new(
        consumer: RingConsumer,
        sessions: Arc<SessionManager>,
        pools: PoolSet,
        facility: Arc<dyn Facility>,
        batching: BatchingConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let capacity = sessions.capacity();
        let max_drain = consumer.ring().capacity();
        Self {
            consumer,
            dispatcher: Dispatcher {
                sessions,
                pools,
                facility,
                batching,
                batches: (0..capacity).map(|_| SendingBatch::default()).collect(),
                open_batches: Vec::with_capacity(capacity),
                pending: PendingFlushes::with_capacity(capacity * 2),
                metrics,
            },
            max_drain,
        }
    }

    /// Drain every published entry once
    pub fn process_available(&mut self) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let dispatcher = &mut self.dispatcher;
        self.consumer.drain(self.max_drain, |entry, end_of_batch| {
            dispatcher.dispatch(entry, &mut outcome);
            if end_of_batch {
                dispatcher.finish_batch(&mut outcome);
            }
        });
        outcome
    }

    /// Process until `token` is cancelled
    pub fn run(mut self, token: &CancellationToken, strategy: WaitStrategy) {
        info!(
            ring_capacity = self.max_drain,
            batching = self.dispatcher.batching.enabled,
            max_batch_size = self.dispatcher.batching.max_batch_size,
            "Request processor started"
        );
        let mut waiter = IdleWaiter::new(strategy);
        while !token.is_cancelled() {
            if self.process_available().entries == 0 {
                waiter.idle();
            } else {
                waiter.reset();
            }
        }
        let discarded = self.discard_remaining();
        info!(discarded, "Request processor stopped");
    }

    /// Return the segments of entries left in the ring after shutdown
    fn discard_remaining(&mut self) -> usize {
        let pools = &self.dispatcher.pools;
        self.consumer.drain(self.max_drain, |entry, _| {
            if let Some(segment) = entry.segment.take() {
                pools.release(segment);
            }
            entry.operation = Operation::ExpiredOperation;
        })
    }
}

impl Dispatcher {
    fn dispatch(&mut self, entry: &mut RequestEntry, outcome: &mut DrainOutcome) {
        outcome.entries += 1;
        match entry.operation {
            Operation::Send => self.handle_send(entry, outcome),
            Operation::Receive => self.handle_receive(entry, outcome),
            // Abandoned claims
            Operation::ExpiredOperation | Operation::AddedToBatch => {
                if let Some(segment) = entry.segment.take() {
                    self.pools.release(segment);
                }
            }
        }
    }

    fn expire(&mut self, entry: &mut RequestEntry, outcome: &mut DrainOutcome) {
        if let Some(segment) = entry.segment.take() {
            self.pools.release(segment);
        }
        entry.operation = Operation::ExpiredOperation;
        outcome.expired += 1;
        self.metrics.record_expired_operations(1);
        debug!(
            session_id = entry.session_id,
            generation = entry.generation,
            "Request expired"
        );
    }

    /// Look up the entry's session and reserve an operation on it
    fn begin(&self, entry: &RequestEntry) -> Option<Arc<Session>> {
        let session = self.sessions.session(entry.session_id)?.clone();
        self.sessions
            .begin_op(&session, entry.generation)
            .then_some(session)
    }

    fn handle_receive(&mut self, entry: &mut RequestEntry, outcome: &mut DrainOutcome) {
        let Some(token) = entry.receive_token.take() else {
            return self.expire(entry, outcome);
        };
        let Some(session) = self.begin(entry) else {
            return self.expire(entry, outcome);
        };
        let Some(segment) = session.take_receive_segment(token, entry.generation) else {
            self.sessions.complete_op(&session);
            return self.expire(entry, outcome);
        };
        self.submit(&session, CompletionQueueKind::Receive, segment, false, outcome);
    }

    fn handle_send(&mut self, entry: &mut RequestEntry, outcome: &mut DrainOutcome) {
        let Some(session) = self.begin(entry) else {
            return self.expire(entry, outcome);
        };
        let segment = match entry.segment.take() {
            Some(segment) => segment,
            None => match std::mem::take(&mut *session.conflation.lock()).segment {
                Some(segment) => segment,
                None => {
                    // Closed before the entry was reached
                    self.sessions.complete_op(&session);
                    return self.expire(entry, outcome);
                }
            },
        };

        if !self.batching.enabled {
            return self.submit(&session, CompletionQueueKind::Send, segment, true, outcome);
        }

        let index = session.id() as usize;
        if self.batches[index].try_append(segment.as_slice()) {
            self.pools.release(segment);
            // The batch already holds an operation for this session
            self.sessions.complete_op(&session);
            entry.operation = Operation::AddedToBatch;
            outcome.batched += 1;
            self.metrics.record_batched_entries(1);
            if self.batches[index].entries >= self.batching.max_batch_size {
                self.close_batch(index, true, outcome);
            }
            return;
        }

        // Does not fit: the open batch goes out first
        if self.batches[index].is_open() {
            self.close_batch(index, false, outcome);
        }
        self.batches[index].open(session, segment);
        self.open_batches.push(index);
        if self.batching.max_batch_size <= 1 {
            self.close_batch(index, true, outcome);
        }
    }

    fn close_batch(&mut self, index: usize, force_flush: bool, outcome: &mut DrainOutcome) {
        if let Some((session, segment)) = self.batches[index].take() {
            self.open_batches.retain(|open| *open != index);
            self.submit(&session, CompletionQueueKind::Send, segment, force_flush, outcome);
        }
    }

    /// Hand a segment to the facility, consuming the operation reserved on
    /// `session`
    fn submit(
        &mut self,
        session: &Arc<Session>,
        kind: CompletionQueueKind,
        segment: Segment,
        force_flush: bool,
        outcome: &mut DrainOutcome,
    ) {
        let key = (session.id(), kind);
        let flush = force_flush
            || !self.batching.enabled
            || self.pending.deferred(key) + 1 >= self.batching.max_batch_size;

        let descriptor = match kind {
            CompletionQueueKind::Send => segment.descriptor(),
            CompletionQueueKind::Receive => segment.receive_descriptor(),
        };
        let queue = session.queue();
        let token = self.pools.hand_off(segment);
        let submitted = match kind {
            CompletionQueueKind::Send => {
                self.facility
                    .submit_send(queue, descriptor, token.as_raw(), flush)
            }
            CompletionQueueKind::Receive => {
                self.facility
                    .submit_receive(queue, descriptor, token.as_raw(), flush)
            }
        };

        if let Err(e) = submitted {
            if let Some(segment) = self.pools.reclaim(token) {
                self.pools.release(segment);
            }
            self.metrics.record_submit_failures(1);
            warn!(
                session_id = session.id(),
                queue = kind.as_str(),
                error = %e,
                "Submission refused, closing session"
            );
            self.sessions.close(session);
            self.sessions.complete_op(session);
            return;
        }

        match kind {
            CompletionQueueKind::Send => {
                outcome.send_submissions += 1;
                self.metrics.record_send_submissions(1);
            }
            CompletionQueueKind::Receive => {
                outcome.receive_submissions += 1;
                self.metrics.record_receive_submissions(1);
            }
        }

        if flush {
            self.pending.remove(key);
            self.commit_pending(outcome);
            self.metrics.record_flushes(1);
        } else {
            self.pending.defer(key, queue);
        }
    }

    /// Commit every deferred submission of every session, returning how many
    /// queues were committed
    fn commit_pending(&mut self, outcome: &mut DrainOutcome) -> usize {
        let mut commits = 0;
        for ((session_id, kind), pending) in self.pending.drain() {
            match self.facility.commit(pending.queue, kind) {
                Ok(()) => commits += 1,
                // The queue closed after the submission; its operations
                // complete through the abort path
                Err(e) => debug!(
                    session_id,
                    queue = kind.as_str(),
                    deferred = pending.deferred,
                    error = %e,
                    "Commit skipped"
                ),
            }
        }
        outcome.commits += commits;
        commits
    }

    fn finish_batch(&mut self, outcome: &mut DrainOutcome) {
        let mut open = std::mem::take(&mut self.open_batches);
        for index in open.drain(..) {
            if let Some((session, segment)) = self.batches[index].take() {
                self.submit(&session, CompletionQueueKind::Send, segment, false, outcome);
            }
        }
        self.open_batches = open;
        if self.commit_pending(outcome) > 0 {
            self.metrics.record_flushes(1);
        }
    }
}
