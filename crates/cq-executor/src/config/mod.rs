//! Polling pool configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use cq_executor::config::PoolConfig;
//!
//! // Defaults with env overrides
//! let config = PoolConfig::from_env();
//!
//! // Or customize programmatically
//! let config = PoolConfig::from_env()
//!     .pool_size(4)
//!     .queue_count(2);
//! ```

pub mod defaults;

use cq_core::env::env_get;
use cq_core::error::CqError;
use std::time::Duration;
use thiserror::Error;

/// Polling thread pool configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of poller threads
    pub pool_size: usize,
    /// Number of completion queues; thread `i` drains queue `i % queue_count`
    pub queue_count: usize,
    /// Per-poll timeout. `None` blocks until an event arrives
    pub poll_timeout: Option<Duration>,
    /// Idle batch contexts kept for reuse
    pub context_pool_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn poll_timeout_from_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

impl PoolConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CQ_POOL_SIZE` - Number of poller threads
    /// - `CQ_QUEUE_COUNT` - Number of completion queues
    /// - `CQ_POLL_TIMEOUT_MS` - Poll timeout in milliseconds (0 = block)
    /// - `CQ_CONTEXT_POOL_CAPACITY` - Idle batch contexts kept
    pub fn from_env() -> Self {
        Self {
            pool_size: env_get("CQ_POOL_SIZE", defaults::POOL_SIZE),
            queue_count: env_get("CQ_QUEUE_COUNT", defaults::QUEUE_COUNT),
            poll_timeout: poll_timeout_from_ms(env_get(
                "CQ_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
            context_pool_capacity: env_get(
                "CQ_CONTEXT_POOL_CAPACITY",
                defaults::CONTEXT_POOL_CAPACITY,
            ),
        }
    }

    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            pool_size: defaults::POOL_SIZE,
            queue_count: defaults::QUEUE_COUNT,
            poll_timeout: poll_timeout_from_ms(defaults::POLL_TIMEOUT_MS),
            context_pool_capacity: defaults::CONTEXT_POOL_CAPACITY,
        }
    }

    // Builder methods

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn queue_count(mut self, n: usize) -> Self {
        self.queue_count = n;
        self
    }

    pub fn poll_timeout(mut self, d: Option<Duration>) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn context_pool_capacity(mut self, cap: usize) -> Self {
        self.context_pool_capacity = cap;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue("pool_size must be > 0"));
        }
        if self.pool_size > defaults::MAX_POOL_SIZE {
            return Err(ConfigError::InvalidValue("pool_size must be <= 256"));
        }
        if self.queue_count == 0 {
            return Err(ConfigError::InvalidValue("queue_count must be > 0"));
        }
        if self.queue_count > self.pool_size {
            // A queue without a poller would never drain.
            return Err(ConfigError::InvalidValue("queue_count must be <= pool_size"));
        }
        if self.context_pool_capacity == 0 {
            return Err(ConfigError::InvalidValue("context_pool_capacity must be > 0"));
        }
        if let Some(timeout) = self.poll_timeout {
            if timeout > Duration::from_millis(defaults::MAX_POLL_TIMEOUT_MS) {
                return Err(ConfigError::InvalidValue(
                    "poll_timeout must be <= 1h (None blocks without a timeout)",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

impl From<ConfigError> for CqError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => CqError::InvalidConfig(msg),
        }
    }
}
