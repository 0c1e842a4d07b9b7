//! # Engine Configuration
//!
//! Centralized configuration and defaults for the zero-copy TCP messaging
//! engine, so that pool sizing, batching policy and polling behaviour are
//! declared in one place instead of being scattered across the engine crate.
//!
//! ## Features
//!
//! - **Defaults**: frame layout constants and sizing defaults
//! - **Engine Configuration**: typed sections for pools, ring, batching,
//!   conflation and completion polling
//! - **Loading**: TOML files with environment-specific overlays and
//!   `ENGINE_` prefixed environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use engine_config::{load_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(None).unwrap_or_default();
//! assert!(config.ring.capacity.is_power_of_two());
//! ```

pub mod defaults;
pub mod engine_config;

// Re-export commonly used types
pub use engine_config::{
    load_config, BatchingConfig, CompletionConfig, ConflationConfig, EngineConfig, PoolConfig,
    ProducerPolicy, RingConfig, SessionConfig, WaitStrategy,
};
