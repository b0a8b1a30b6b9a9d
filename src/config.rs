//! Configuration management for the aggregation core
//!
//! TOML configuration files with environment variable overrides and
//! sensible defaults. The split prime is a deployment-wide constant: every
//! node producing or consuming a split set must load the same value.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::info;

use crate::error::{Error, Result};
use crate::session::MemoryReservation;
use crate::split::{FtgsSplitter, SpillBudget};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Split fan-out settings
    #[serde(default)]
    pub split: SplitConfig,

    /// Memory accounting
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Worker pool and batch sizing
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Logging and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Split fan-out configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SplitConfig {
    /// Large prime mixed into the partition function
    #[serde(default = "default_large_prime")]
    pub large_prime: i32,

    /// Default number of splits for a fan-out request
    #[serde(default = "default_num_splits")]
    pub num_splits: usize,

    /// Byte budget shared by all spill buffers of one split (0 = unbounded)
    #[serde(default)]
    pub spill_budget_bytes: u64,
}

/// Memory accounting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Ceiling for the shared reservation in bytes
    #[serde(default = "default_memory_ceiling")]
    pub ceiling_bytes: u64,

    /// Fixed amount claimed by each multi-session at construction
    #[serde(default)]
    pub multi_session_claim_bytes: u64,
}

/// Executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Threads in the shared shard worker pool
    #[serde(default = "default_workers")]
    pub worker_threads: usize,

    /// Document ids read per batch in the per-term loop
    #[serde(default = "default_doc_batch_size")]
    pub doc_batch_size: usize,

    /// Group every document starts in when a session opens
    #[serde(default = "default_initial_group")]
    pub initial_group: u32,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Record prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_large_prime() -> i32 { 2_147_483_629 }
fn default_num_splits() -> usize { 16 }
fn default_memory_ceiling() -> u64 { 8 * 1024 * 1024 * 1024 }
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_doc_batch_size() -> usize { 4096 }
fn default_initial_group() -> u32 { 1 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            large_prime: default_large_prime(),
            num_splits: default_num_splits(),
            spill_budget_bytes: 0,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: default_memory_ceiling(),
            multi_session_claim_bytes: 0,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_workers(),
            doc_batch_size: default_doc_batch_size(),
            initial_group: default_initial_group(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Split
        if let Ok(prime) = std::env::var("FTGS_LARGE_PRIME") {
            if let Ok(p) = prime.parse() {
                self.split.large_prime = p;
            }
        }
        if let Ok(splits) = std::env::var("FTGS_NUM_SPLITS") {
            if let Ok(n) = splits.parse() {
                self.split.num_splits = n;
            }
        }

        // Memory
        if let Ok(ceiling) = std::env::var("FTGS_MEMORY_CEILING") {
            if let Ok(bytes) = ceiling.parse() {
                self.memory.ceiling_bytes = bytes;
            }
        }

        // Executor
        if let Ok(workers) = std::env::var("FTGS_WORKER_THREADS") {
            if let Ok(n) = workers.parse() {
                self.executor.worker_threads = n;
            }
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("FTGS_LOG_LEVEL") {
            self.monitoring.log_level = log_level;
        }
        if let Ok(enabled) = std::env::var("FTGS_METRICS_ENABLED") {
            if let Ok(flag) = enabled.parse() {
                self.monitoring.metrics_enabled = flag;
            }
        }
    }

    /// Install the process-wide settings: metric recording on or off
    pub fn apply(&self) -> Result<()> {
        self.validate()?;
        self.monitoring.apply();
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.split.large_prime <= 1 {
            return Err(Error::Configuration("Large prime must be > 1".to_string()));
        }
        if self.split.num_splits == 0 {
            return Err(Error::Configuration("Number of splits must be > 0".to_string()));
        }
        if self.memory.ceiling_bytes == 0 {
            return Err(Error::Configuration("Memory ceiling must be > 0".to_string()));
        }
        if self.memory.multi_session_claim_bytes > self.memory.ceiling_bytes {
            return Err(Error::Configuration(
                "Multi-session claim cannot exceed the memory ceiling".to_string(),
            ));
        }
        if self.executor.worker_threads == 0 {
            return Err(Error::Configuration("Worker threads must be > 0".to_string()));
        }
        if self.executor.doc_batch_size == 0 {
            return Err(Error::Configuration("Doc batch size must be > 0".to_string()));
        }
        if self.executor.initial_group == 0 {
            return Err(Error::Configuration(
                "Initial group cannot be the excluded group 0".to_string(),
            ));
        }
        self.monitoring.level_filter()?;

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }
}

impl SplitConfig {
    /// Splitter using the configured prime
    pub fn splitter(&self) -> FtgsSplitter {
        FtgsSplitter::new(self.large_prime)
    }

    /// Shared spill budget, if one is configured
    pub fn spill_budget(&self) -> Option<SpillBudget> {
        (self.spill_budget_bytes > 0).then(|| SpillBudget::new(self.spill_budget_bytes))
    }
}

impl MonitoringConfig {
    /// Parsed `log_level`, for the host's tracing subscriber
    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log_level.parse().map_err(|_| {
            Error::Configuration(format!("Unknown log level '{}'", self.log_level))
        })
    }

    /// Turn metric recording on or off to match `metrics_enabled`
    pub fn apply(&self) {
        crate::metrics::set_enabled(self.metrics_enabled);
        info!(
            metrics_enabled = self.metrics_enabled,
            log_level = %self.log_level,
            "Applied monitoring settings"
        );
    }
}

impl MemoryConfig {
    /// Fresh reservation with the configured ceiling
    pub fn reservation(&self) -> Arc<MemoryReservation> {
        Arc::new(MemoryReservation::new(self.ceiling_bytes))
    }
}

impl ExecutorConfig {
    /// Build the shard worker pool
    pub fn build_pool(&self) -> Result<Arc<rayon::ThreadPool>> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_threads)
            .thread_name(|i| format!("ftgs-shard-{}", i))
            .build()
            .map(Arc::new)
            .map_err(|e| Error::Configuration(format!("Failed to build worker pool: {}", e)))
    }
}
