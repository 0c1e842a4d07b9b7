//! Idle strategies for polling loops
//!
//! `BusySpin` never gives up the core. `Cooperative` spins briefly, then
//! yields, then parks for a few microseconds so idle processors do not starve
//! other threads on the machine.

use engine_config::WaitStrategy;
use std::time::Duration;

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 128;
const PARK_DURATION: Duration = Duration::from_micros(50);

#[derive(Debug)]
pub struct IdleWaiter {
    strategy: WaitStrategy,
    idle_rounds: u32,
}

impl IdleWaiter {
    pub fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            idle_rounds: 0,
        }
    }

    /// Called after a poll that found no work
    #[inline]
    pub fn idle(&mut self) {
        match self.strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Cooperative => {
                if self.idle_rounds < SPIN_LIMIT {
                    std::hint::spin_loop();
                } else if self.idle_rounds < YIELD_LIMIT {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(PARK_DURATION);
                }
                self.idle_rounds = self.idle_rounds.saturating_add(1);
            }
        }
    }

    /// Called after a poll that found work
    #[inline]
    pub fn reset(&mut self) {
        self.idle_rounds = 0;
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }
}
