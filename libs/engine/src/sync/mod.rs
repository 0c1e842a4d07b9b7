//! Thread coordination primitives shared by the pool, ring and processors

pub mod cancellation;
pub mod semaphore;
pub mod wait;

pub use cancellation::CancellationToken;
pub use semaphore::{AcquireError, Semaphore};
pub use wait::IdleWaiter;
