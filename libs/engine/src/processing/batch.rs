//! Per-dequeue-batch bookkeeping of the request processor

use crate::buffers::Segment;
use crate::facility::{CompletionQueueKind, RequestQueueId};
use crate::session::{Session, SessionId};
use std::collections::HashMap;
use std::sync::Arc;

/// Send segment of one session that later entries are appended to
#[derive(Default)]
pub(crate) struct SendingBatch {
    pub segment: Option<Segment>,
    pub session: Option<Arc<Session>>,
    pub entries: usize,
}

impl SendingBatch {
    pub fn is_open(&self) -> bool {
        self.segment.is_some()
    }

    pub fn open(&mut self, session: Arc<Session>, segment: Segment) {
        self.segment = Some(segment);
        self.session = Some(session);
        self.entries = 1;
    }

    /// Copy `bytes` into the open segment; false when they do not fit
    pub fn try_append(&mut self, bytes: &[u8]) -> bool {
        let appended = self
            .segment
            .as_mut()
            .is_some_and(|segment| segment.append(bytes));
        if appended {
            self.entries += 1;
        }
        appended
    }

    pub fn take(&mut self) -> Option<(Arc<Session>, Segment)> {
        self.entries = 0;
        match (self.session.take(), self.segment.take()) {
            (Some(session), Some(segment)) => Some((session, segment)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingFlush {
    pub queue: RequestQueueId,
    pub deferred: usize,
}

pub(crate) type FlushKey = (SessionId, CompletionQueueKind);

/// Submissions made with `flush == false` that still need a commit
#[derive(Default)]
pub(crate) struct PendingFlushes {
    entries: HashMap<FlushKey, PendingFlush>,
}

impl PendingFlushes {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn deferred(&self, key: FlushKey) -> usize {
        self.entries.get(&key).map_or(0, |pending| pending.deferred)
    }

    pub fn defer(&mut self, key: FlushKey, queue: RequestQueueId) {
        self.entries
            .entry(key)
            .or_insert(PendingFlush { queue, deferred: 0 })
            .deferred += 1;
    }

    pub fn remove(&mut self, key: FlushKey) {
        self.entries.remove(&key);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every pending flush, keeping the allocation
    pub fn drain(&mut self) -> impl Iterator<Item = (FlushKey, PendingFlush)> + '_ {
        self.entries.drain()
    }
}
