//! Request and completion processing
//!
//! - [`ring`]: bounded MPSC ring producers publish requests into
//! - [`request`]: the single consumer that batches and submits them
//! - [`completion`]: polling loops for the send and receive completion queues

mod batch;
pub mod completion;
pub mod entry;
pub mod request;
pub mod ring;

pub use completion::{
    CompletionHandler, CompletionProcessor, ReceiveCompletionHandler, SendCompletionHandler,
};
pub use entry::{Operation, RequestEntry};
pub use request::{DrainOutcome, RequestProcessor};
pub use ring::{Claim, RequestRing, RingConsumer};
