//! Engine Metrics
//!
//! Lock-free counters updated on the hot path with relaxed atomics and read
//! as a consistent-enough snapshot for logging and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident => $record:ident),* $(,)?) => {
        /// Engine-wide counters
        #[derive(Debug)]
        pub struct EngineMetrics {
            started_at: Instant,
            $($name: AtomicU64,)*
        }

        /// Point-in-time copy of [`EngineMetrics`]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            pub uptime_ms: u64,
            $($(#[$doc])* pub $name: u64,)*
        }

        impl EngineMetrics {
            pub fn new() -> Self {
                Self {
                    started_at: Instant::now(),
                    $($name: AtomicU64::new(0),)*
                }
            }

            $(
                #[inline]
                pub fn $record(&self, count: u64) {
                    self.$name.fetch_add(count, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    uptime_ms: self.started_at.elapsed().as_millis() as u64,
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Frames accepted by `send`
    messages_sent => record_messages_sent,
    /// Bytes reported by successful send completions
    bytes_sent => record_bytes_sent,
    /// Send submissions made to the facility
    send_submissions => record_send_submissions,
    /// Entries whose bytes were copied into another send
    batched_entries => record_batched_entries,
    /// Frames merged into a not-yet-submitted send segment
    conflated_messages => record_conflated_messages,
    /// Flush points: forced flushes and batch boundaries that committed work
    flushes => record_flushes,
    /// Receive submissions made to the facility
    receive_submissions => record_receive_submissions,
    /// Complete frames delivered to the handler
    messages_received => record_messages_received,
    /// Bytes reported by receive completions
    bytes_received => record_bytes_received,
    /// Entries dropped because their session went away
    expired_operations => record_expired_operations,
    /// Completions for segments or sessions that were no longer waiting
    stale_completions => record_stale_completions,
    /// Sessions closed for a framing violation
    protocol_violations => record_protocol_violations,
    /// Zero-byte completions observed
    disconnects => record_disconnects,
    /// Submissions the facility refused
    submit_failures => record_submit_failures,
    sessions_opened => record_sessions_opened,
    sessions_closed => record_sessions_closed,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
