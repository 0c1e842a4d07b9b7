//! # Messaging Engine
//!
//! Zero-copy TCP messaging over a completion-queue socket facility.
//!
//! ## Architecture
//!
//! - **Buffers**: registered memory carved into fixed-size segments, rented by
//!   producers and handed to the facility by packed integer token
//! - **Protocol**: `[u32 LE length][body]` frames and an incremental framer
//! - **Processing**: an MPSC request ring drained by a single request
//!   processor, plus one polling loop per completion queue
//! - **Sessions**: preallocated, generation-tagged sessions with deferred reset
//! - **Facility**: the traits the engine drives, and an emulated TCP facility
//!
//! ## Usage
//!
//! ```rust,no_run
//! use engine::{EngineConfig, MessagingEngine, ReceivedMessage, SessionHandler, TcpFacility};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl SessionHandler for Echo {
//!     fn on_message(&self, message: &ReceivedMessage<'_>) {
//!         let _ = message.engine.send(message.session_id, message.payload);
//!     }
//! }
//!
//! # fn main() -> engine::Result<()> {
//! let facility = Arc::new(TcpFacility::new());
//! let engine = MessagingEngine::start(EngineConfig::default(), facility.clone(), Arc::new(Echo))?;
//!
//! let stream = std::net::TcpStream::connect("127.0.0.1:9000")?;
//! let session = engine.acquire_session()?;
//! engine.open_session(session, facility.adopt(stream)?)?;
//! engine.send(session, b"hello")?;
//! engine.shutdown()
//! # }
//! ```

pub mod buffers;
pub mod engine;
pub mod error;
pub mod facility;
pub mod metrics;
pub mod processing;
pub mod protocol;
pub mod session;
pub mod sync;

pub use buffers::{PoolStats, Segment, SegmentPool, SegmentToken};
pub use engine::{EngineHandle, MessagingEngine};
pub use error::{EngineError, Result};
pub use facility::{Facility, SocketHandle, TcpFacility};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use protocol::{encode_frame, MessageFramer, FRAME_HEADER_LEN};
pub use session::{ReceivedMessage, SessionHandler, SessionId, SessionInfo};

pub use engine_config::EngineConfig;
