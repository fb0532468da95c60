//! Pool and runner configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for one worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum queued tasks before rejection.
    pub max_queue_size: usize,
    /// Maximum concurrent worker threads.
    pub max_pool_size: usize,
    /// Idle workers exit after this many seconds.
    pub max_worker_idle_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 64,
            max_pool_size: num_cpus::get().max(1),
            max_worker_idle_secs: 30,
        }
    }
}

impl PoolConfig {
    /// Default configuration, for use with the `with_*` builders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue capacity.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the worker cap.
    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// Set the idle-worker timeout in seconds.
    pub fn with_max_worker_idle_secs(mut self, secs: u64) -> Self {
        self.max_worker_idle_secs = secs;
        self
    }

    /// The idle-worker timeout as a `Duration`.
    pub fn max_worker_idle(&self) -> Duration {
        Duration::from_secs(self.max_worker_idle_secs)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".into());
        }
        if self.max_pool_size == 0 {
            return Err("max_pool_size must be greater than 0".into());
        }
        if self.max_worker_idle_secs == 0 {
            return Err("max_worker_idle_secs must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root runner configuration: pool name to settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Map of pool name to configuration.
    pub pools: HashMap<String, PoolConfig>,
}

impl RunnerConfig {
    /// Validate all pools and require at least one.
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one pool must be defined".into());
        }
        for (name, pool) in &self.pools {
            pool.validate()
                .map_err(|e| format!("pool `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse runner configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: RunnerConfig =
            serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
