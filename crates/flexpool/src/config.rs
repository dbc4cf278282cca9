//! Dispatcher configuration
//!
//! Worker count and queue sizing, loaded from code or environment variables.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Default number of workers
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default queue slots per worker
pub const DEFAULT_BUFFER_MULTIPLIER: usize = 100;

/// Default hard ceiling on queue capacity
pub const DEFAULT_BUFFER_LIMIT: usize = 1_000_000;

/// Dispatcher configuration
///
/// # Example
///
/// ```
/// use flexpool::DispatcherConfig;
///
/// let config = DispatcherConfig::new(4)
///     .with_buffer_multiplier(10)
///     .with_buffer_limit(1_000);
///
/// assert_eq!(config.capacity_for(4), 40);
/// assert_eq!(config.capacity_for(500), 1_000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Initial target worker count (at least 1)
    pub worker_count: usize,

    /// Queue slots allotted per worker
    pub buffer_multiplier: usize,

    /// Hard ceiling on the capacity of each queue
    pub buffer_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            buffer_multiplier: DEFAULT_BUFFER_MULTIPLIER,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration with the given worker count
    pub fn new(worker_count: usize) -> Self {
        Self::default().with_worker_count(worker_count)
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FLEXPOOL_WORKERS`: Initial worker count (default: 3)
    /// - `FLEXPOOL_BUFFER_MULTIPLIER`: Queue slots per worker (default: 100)
    /// - `FLEXPOOL_BUFFER_LIMIT`: Queue capacity ceiling (default: 1000000)
    pub fn from_env() -> Self {
        let worker_count = env_usize("FLEXPOOL_WORKERS").unwrap_or(DEFAULT_WORKER_COUNT);
        let buffer_multiplier =
            env_usize("FLEXPOOL_BUFFER_MULTIPLIER").unwrap_or(DEFAULT_BUFFER_MULTIPLIER);
        let buffer_limit = env_usize("FLEXPOOL_BUFFER_LIMIT").unwrap_or(DEFAULT_BUFFER_LIMIT);

        Self::default()
            .with_worker_count(worker_count)
            .with_buffer_multiplier(buffer_multiplier)
            .with_buffer_limit(buffer_limit)
    }

    /// Set the worker count (coerced to at least 1)
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set queue slots per worker (coerced to at least 1)
    pub fn with_buffer_multiplier(mut self, multiplier: usize) -> Self {
        self.buffer_multiplier = multiplier.max(1);
        self
    }

    /// Set the queue capacity ceiling (coerced to at least 1)
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit.max(1);
        self
    }

    /// Queue capacity for a pool of `workers` workers
    pub fn capacity_for(&self, workers: usize) -> usize {
        workers
            .max(1)
            .saturating_mul(self.buffer_multiplier)
            .clamp(1, self.buffer_limit.max(1))
    }

    /// Validate the configuration
    ///
    /// Builder methods already coerce values; this catches structs built
    /// by hand or deserialized.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.worker_count == 0 {
            return Err(DispatchError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.buffer_multiplier == 0 {
            return Err(DispatchError::InvalidConfig(
                "buffer_multiplier must be at least 1".into(),
            ));
        }
        if self.buffer_limit == 0 {
            return Err(DispatchError::InvalidConfig(
                "buffer_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Copy of this configuration with every field coerced into range
    pub(crate) fn normalized(&self) -> Self {
        Self {
            worker_count: self.worker_count.max(1),
            buffer_multiplier: self.buffer_multiplier.max(1),
            buffer_limit: self.buffer_limit.max(1),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
