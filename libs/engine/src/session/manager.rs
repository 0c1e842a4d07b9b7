//! Session Manager
//!
//! Owns the preallocated sessions, the free list and the peer index, and runs
//! every lifecycle transition. Closing is split in two: `close` detaches the
//! socket and raises the closed event at once, while the reset that returns a
//! session to the free list waits until its last in-flight operation has
//! completed.

use super::session::{Conflation, Session, SessionState};
use super::{SessionHandler, SessionId};
use crate::buffers::PoolSet;
use crate::facility::{Facility, QueueDepth, SocketHandle};
use crate::metrics::EngineMetrics;
use crate::{EngineError, Result};
use dashmap::DashMap;
use engine_config::EngineConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SessionManager {
    sessions: Box<[Arc<Session>]>,
    free: Mutex<Vec<SessionId>>,
    peers: DashMap<Arc<str>, SessionId>,
    facility: Arc<dyn Facility>,
    pools: PoolSet,
    handler: Arc<dyn SessionHandler>,
    depth: QueueDepth,
    metrics: Arc<EngineMetrics>,
}

impl SessionManager {
    pub fn new(
        config: &EngineConfig,
        facility: Arc<dyn Facility>,
        pools: PoolSet,
        handler: Arc<dyn SessionHandler>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let count = config.sessions.count;
        let sessions: Box<[Arc<Session>]> = (0..count)
            .map(|id| {
                Arc::new(Session::new(
                    id as SessionId,
                    config.sessions.max_outstanding_receives,
                    config.max_frame_length,
                ))
            })
            .collect();
        // Lowest ids are handed out first
        let free = (0..count as SessionId).rev().collect();

        Self {
            sessions,
            free: Mutex::new(free),
            peers: DashMap::with_capacity(count),
            facility,
            pools,
            handler,
            depth: QueueDepth {
                max_outstanding_receives: config.sessions.max_outstanding_receives,
                max_outstanding_sends: config.sessions.max_outstanding_sends,
            },
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions not currently acquired
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn handler(&self) -> &Arc<dyn SessionHandler> {
        &self.handler
    }

    /// Take a free session
    pub fn acquire(&self) -> Result<Arc<Session>> {
        let id = self
            .free
            .lock()
            .pop()
            .ok_or(EngineError::NoSessionAvailable {
                capacity: self.sessions.len(),
            })?;
        let session = self.sessions[id as usize].clone();
        let acquired = session.transition(SessionState::Free, SessionState::Acquired);
        debug_assert!(acquired, "free list held session {} in state {:?}", id, session.state());
        Ok(session)
    }

    /// Bind an acquired session to a socket and assign its receive segments.
    /// The caller posts the receives.
    pub fn open(&self, session: &Arc<Session>, socket: SocketHandle) -> Result<()> {
        // An active session drops its old binding and is rebound in place
        if self.close(session) {
            self.reacquire(session);
        }
        if session.state() != SessionState::Acquired {
            return Err(EngineError::session_not_found(format!(
                "session {} is {:?}, not acquired",
                session.id(),
                session.state()
            )));
        }

        let mut segments = Vec::with_capacity(self.depth.max_outstanding_receives);
        for _ in 0..self.depth.max_outstanding_receives {
            match self.pools.receive().rent() {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    segments.into_iter().for_each(|s| self.pools.release(s));
                    return Err(e);
                }
            }
        }

        let queue = match self
            .facility
            .create_request_queue(socket, session.correlation(), self.depth)
        {
            Ok(queue) => queue,
            Err(e) => {
                segments.into_iter().for_each(|s| self.pools.release(s));
                return Err(e);
            }
        };

        for (index, segment) in segments.into_iter().enumerate() {
            session.assign_receive_segment(index, segment);
        }
        session.set_binding(socket, queue);
        session.framer.lock().reset();
        session.transition(SessionState::Acquired, SessionState::Active);

        self.metrics.record_sessions_opened(1);
        info!(
            session_id = session.id(),
            generation = session.generation(),
            socket = socket.0,
            "Session opened"
        );
        Ok(())
    }

    /// Close an active session. Only the first call does anything; it
    /// detaches the socket, aborts posted operations and raises the closed
    /// event. Returns whether this call closed the session.
    pub fn close(&self, session: &Session) -> bool {
        if !session.transition(SessionState::Active, SessionState::Closing) {
            return false;
        }
        let generation = session.bump_generation();

        let conflated = std::mem::take(&mut *session.conflation.lock());
        if let Some(segment) = conflated.segment {
            self.pools.release(segment);
        }

        if let Err(e) = self.facility.close_socket(session.socket()) {
            warn!(session_id = session.id(), error = %e, "Failed to close socket");
        }

        let peer = session.set_peer_id(None);
        if let Some(peer) = &peer {
            self.peers
                .remove_if(peer, |_, bound| *bound == session.id());
        }

        self.metrics.record_sessions_closed(1);
        info!(
            session_id = session.id(),
            next_generation = generation,
            in_flight = session.in_flight(),
            "Session closed"
        );
        self.handler.on_closed(session.id(), peer.as_deref());

        self.try_finish(session);
        true
    }

    /// Take a session closed by `open` back to Acquired for its caller. The
    /// close already bumped the generation; operations of the old binding
    /// still in flight complete as stale.
    fn reacquire(&self, session: &Session) {
        let mut free = self.free.lock();
        if session.transition(SessionState::Closing, SessionState::Acquired) {
            drop(free);
            for segment in session.drain_receive_segments() {
                self.pools.release(segment);
            }
        } else if session.state() == SessionState::Free {
            // Drained during close and already on the free list
            free.retain(|&id| id != session.id());
            session.transition(SessionState::Free, SessionState::Acquired);
        }
        debug!(
            session_id = session.id(),
            generation = session.generation(),
            in_flight = session.in_flight(),
            "Session reacquired for a new socket"
        );
    }

    /// Give a session back: acquired sessions return to the free list now,
    /// active ones close and return once drained
    pub fn release(&self, session: &Session) {
        match session.state() {
            SessionState::Acquired => {
                if session.transition(SessionState::Acquired, SessionState::Closing) {
                    self.try_finish(session);
                }
            }
            SessionState::Active => {
                self.close(session);
            }
            SessionState::Closing | SessionState::Free => {}
        }
    }

    /// Reserve an operation against `generation`. On success the caller must
    /// later call [`complete_op`](Self::complete_op).
    pub(crate) fn begin_op(&self, session: &Session, generation: u32) -> bool {
        session.increment_in_flight();
        if session.is_current(generation) {
            return true;
        }
        self.complete_op(session);
        false
    }

    pub(crate) fn complete_op(&self, session: &Session) {
        if session.decrement_in_flight() {
            self.try_finish(session);
        }
    }

    /// Return a drained closing session to the free list
    fn try_finish(&self, session: &Session) {
        if session.in_flight() != 0 {
            return;
        }
        // Held until the id is back on the list so `reacquire` never sees a
        // Free session that is missing from it
        let mut free = self.free.lock();
        if !session.transition(SessionState::Closing, SessionState::Free) {
            return;
        }

        for segment in session.drain_receive_segments() {
            self.pools.release(segment);
        }
        let conflated: Conflation = std::mem::take(&mut *session.conflation.lock());
        if let Some(segment) = conflated.segment {
            self.pools.release(segment);
        }
        session.framer.lock().reset();
        if let Some(peer) = session.set_peer_id(None) {
            self.peers.remove_if(&peer, |_, bound| *bound == session.id());
        }

        free.push(session.id());
        drop(free);
        debug!(session_id = session.id(), "Session returned to pool");
    }

    /// Any session by id, whatever its state
    #[inline]
    pub fn session(&self, id: SessionId) -> Option<&Arc<Session>> {
        self.sessions.get(id as usize)
    }

    /// An active session by id
    pub fn try_get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.session(id).filter(|s| s.is_active()).cloned()
    }

    /// An active session by bound peer id
    pub fn try_get_by_peer(&self, peer: &str) -> Option<Arc<Session>> {
        let id = *self.peers.get(peer)?;
        self.try_get(id)
    }

    /// Associate a peer id with an active session, replacing any earlier
    /// binding of either
    pub fn bind_peer(&self, session: &Session, peer: &str) -> Result<()> {
        if !session.is_active() {
            return Err(EngineError::session_not_found(session.id()));
        }
        let key: Arc<str> = Arc::from(peer);
        if let Some(previous) = session.set_peer_id(Some(key.clone())) {
            self.peers.remove_if(&previous, |_, bound| *bound == session.id());
        }
        if let Some(other) = self.peers.insert(key, session.id()) {
            if other != session.id() {
                warn!(peer, from = other, to = session.id(), "Peer id rebound to another session");
                if let Some(other) = self.session(other) {
                    if other.peer_id().as_deref() == Some(peer) {
                        other.set_peer_id(None);
                    }
                }
            }
        }
        Ok(())
    }

    /// Close every active session and release acquired ones
    pub fn close_all(&self) {
        for session in self.sessions.iter() {
            self.release(session);
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active()).count()
    }
}
