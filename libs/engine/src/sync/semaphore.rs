//! Counting semaphore with bounded waits
//!
//! Permits track free segments in a pool. `close` wakes every waiter and makes
//! further acquires fail, which is how pool cancellation reaches blocked
//! renters.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// No permit became available before the deadline
    Timeout,
    /// The semaphore was closed
    Closed,
}

#[derive(Debug)]
struct State {
    permits: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Take a permit without waiting; `Ok(false)` when none are free
    pub fn try_acquire(&self) -> Result<bool, AcquireError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AcquireError::Closed);
        }
        if state.permits == 0 {
            return Ok(false);
        }
        state.permits -= 1;
        Ok(true)
    }

    /// Take a permit, waiting at most `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<(), AcquireError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(AcquireError::Closed);
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return Err(AcquireError::Closed);
                }
                if state.permits > 0 {
                    state.permits -= 1;
                    return Ok(());
                }
                return Err(AcquireError::Timeout);
            }
        }
    }

    /// Return `count` permits and wake as many waiters
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.permits += count;
        drop(state);
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Fail all current and future acquires
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn available(&self) -> usize {
        self.state.lock().permits
    }
}
