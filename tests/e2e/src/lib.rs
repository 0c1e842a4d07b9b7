//! End-to-End Test Framework
//!
//! Runs two messaging engines in one process, connected over a localhost TCP
//! socket, and drives typed messages between them.

pub mod framework;
pub mod scenarios;

pub use framework::{Node, PingPongPair, PongEvent};
pub use scenarios::{ping_pong, ScenarioReport};
