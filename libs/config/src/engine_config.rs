//! Engine Configuration Module
//!
//! Provides configuration loading and validation for the messaging engine.
//! Supports loading from TOML files with environment-specific overrides and
//! `ENGINE_` prefixed environment variables (`ENGINE_BATCHING__ENABLED=false`).

use crate::defaults::{frame, pools, processing, sessions};
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main engine configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Session pool sizing
    pub sessions: SessionConfig,

    /// Segment pool backing outbound messages
    #[serde(deserialize_with = "send_pool")]
    pub send_pool: PoolConfig,

    /// Segment pool backing posted receives
    #[serde(deserialize_with = "receive_pool")]
    pub receive_pool: PoolConfig,

    /// Request entry ring
    pub ring: RingConfig,

    /// Deferred flushing and send batching
    pub batching: BatchingConfig,

    /// Producer-side merging into not-yet-submitted sends
    pub conflation: ConflationConfig,

    /// Completion polling loops
    pub completions: CompletionConfig,

    /// Largest frame body accepted from a peer
    pub max_frame_length: usize,
}

/// Session pool sizing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub count: usize,
    pub max_outstanding_receives: usize,
    pub max_outstanding_sends: usize,
}

/// Segment pool sizing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub segment_length: usize,
    pub segment_count: usize,
    /// How long `rent` waits before reporting backpressure
    pub acquire_timeout_ms: u64,
}

/// Producer behaviour when the request ring is full
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProducerPolicy {
    /// Spin until a slot frees up or the claim timeout expires
    Blocking,
    /// Fail immediately with backpressure
    NonBlocking,
}

/// Request entry ring settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RingConfig {
    pub capacity: usize,
    pub producer_policy: ProducerPolicy,
    pub claim_timeout_us: u64,
    /// Idle behaviour of the request processor
    pub wait_strategy: WaitStrategy,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BatchingConfig {
    pub enabled: bool,
    /// Deferred submissions per session and request kind before a flush is forced
    pub max_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConflationConfig {
    pub enabled: bool,
    pub max_conflation_count: usize,
}

/// Idle behaviour of a polling loop
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Spin on the CPU with a spin-loop hint
    BusySpin,
    /// Spin briefly, then yield the thread to the scheduler
    Cooperative,
}

/// Completion polling settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CompletionConfig {
    pub max_completion_results: usize,
    pub send_wait_strategy: WaitStrategy,
    pub receive_wait_strategy: WaitStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            count: sessions::SESSION_COUNT,
            max_outstanding_receives: sessions::MAX_OUTSTANDING_RECEIVES,
            max_outstanding_sends: sessions::MAX_OUTSTANDING_SENDS,
        }
    }
}

impl PoolConfig {
    /// Defaults for the outbound pool
    pub fn send() -> Self {
        Self {
            segment_length: pools::SEND_SEGMENT_LENGTH,
            segment_count: pools::SEND_SEGMENT_COUNT,
            acquire_timeout_ms: pools::BUFFER_ACQUIRE_TIMEOUT_MS,
        }
    }

    /// Defaults for the inbound pool
    pub fn receive() -> Self {
        Self {
            segment_length: pools::RECEIVE_SEGMENT_LENGTH,
            segment_count: pools::RECEIVE_SEGMENT_COUNT,
            acquire_timeout_ms: pools::BUFFER_ACQUIRE_TIMEOUT_MS,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::send()
    }
}

/// A pool table as written; fields left out keep that pool's own defaults
#[derive(Deserialize)]
struct PoolOverrides {
    segment_length: Option<usize>,
    segment_count: Option<usize>,
    acquire_timeout_ms: Option<u64>,
}

impl PoolOverrides {
    fn apply(self, base: PoolConfig) -> PoolConfig {
        PoolConfig {
            segment_length: self.segment_length.unwrap_or(base.segment_length),
            segment_count: self.segment_count.unwrap_or(base.segment_count),
            acquire_timeout_ms: self.acquire_timeout_ms.unwrap_or(base.acquire_timeout_ms),
        }
    }
}

fn send_pool<'de, D>(deserializer: D) -> std::result::Result<PoolConfig, D::Error>
where
    D: Deserializer<'de>,
{
    PoolOverrides::deserialize(deserializer).map(|o| o.apply(PoolConfig::send()))
}

fn receive_pool<'de, D>(deserializer: D) -> std::result::Result<PoolConfig, D::Error>
where
    D: Deserializer<'de>,
{
    PoolOverrides::deserialize(deserializer).map(|o| o.apply(PoolConfig::receive()))
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: processing::RING_CAPACITY,
            producer_policy: ProducerPolicy::Blocking,
            claim_timeout_us: processing::RING_CLAIM_TIMEOUT_US,
            wait_strategy: WaitStrategy::Cooperative,
        }
    }
}

impl RingConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_micros(self.claim_timeout_us)
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: processing::MAX_BATCH_SIZE,
        }
    }
}

impl Default for ConflationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_conflation_count: processing::MAX_CONFLATION_COUNT,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_completion_results: processing::MAX_COMPLETION_RESULTS,
            send_wait_strategy: WaitStrategy::Cooperative,
            receive_wait_strategy: WaitStrategy::Cooperative,
        }
    }
}

impl EngineConfig {
    /// Load configuration from files with environment overrides
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/engine.toml"));

        let mut builder = Config::builder().add_source(File::from(base).required(true));

        // Add environment-specific overrides if specified
        if let Some(env) = environment {
            let env_file = base
                .parent()
                .map(|dir| dir.join("environments"))
                .unwrap_or_else(|| PathBuf::from("config/environments"))
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // Override with environment variables (ENGINE_ prefix, `__` between sections)
        builder = builder.add_source(
            Environment::with_prefix("ENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(?config, "Loaded engine configuration");
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sessions.count == 0 {
            bail!("sessions.count must be greater than zero");
        }
        if self.sessions.count > u32::MAX as usize {
            bail!("sessions.count must fit in 32 bits");
        }
        if self.sessions.max_outstanding_receives == 0 {
            bail!("sessions.max_outstanding_receives must be greater than zero");
        }
        if !self.ring.capacity.is_power_of_two() {
            bail!(
                "ring.capacity must be a power of two (got {})",
                self.ring.capacity
            );
        }
        if self.batching.max_batch_size == 0 {
            bail!("batching.max_batch_size must be greater than zero");
        }
        if self.conflation.enabled && self.conflation.max_conflation_count == 0 {
            bail!("conflation.max_conflation_count must be greater than zero");
        }
        if self.completions.max_completion_results == 0 {
            bail!("completions.max_completion_results must be greater than zero");
        }

        for (name, pool) in [("send_pool", &self.send_pool), ("receive_pool", &self.receive_pool)] {
            if pool.segment_count == 0 {
                bail!("{}.segment_count must be greater than zero", name);
            }
            if pool.segment_length <= frame::HEADER_LEN {
                bail!(
                    "{}.segment_length must exceed the {} byte frame header",
                    name,
                    frame::HEADER_LEN
                );
            }
        }

        let posted = self.sessions.count * self.sessions.max_outstanding_receives;
        if posted > self.receive_pool.segment_count {
            bail!(
                "receive_pool.segment_count ({}) cannot back {} sessions x {} posted receives",
                self.receive_pool.segment_count,
                self.sessions.count,
                self.sessions.max_outstanding_receives
            );
        }

        if self.max_frame_length == 0 {
            bail!("max_frame_length must be greater than zero");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sessions: SessionConfig::default(),
            send_pool: PoolConfig::send(),
            receive_pool: PoolConfig::receive(),
            ring: RingConfig::default(),
            batching: BatchingConfig::default(),
            conflation: ConflationConfig::default(),
            completions: CompletionConfig::default(),
            max_frame_length: frame::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Convenience function to load configuration with defaults
pub fn load_config(environment: Option<&str>) -> Result<EngineConfig> {
    EngineConfig::load(None, environment)
}
