//! Configuration Module - Runtime Tuning Parameters
//!
//! Manages all configuration parameters for the runtime core. Most
//! parameters have sensible defaults; `validate()` rejects combinations
//! the allocator cannot honor.

use crate::error::{Result, RuntimeError};

/// Main configuration for the Rill runtime
///
/// # Examples
///
/// ```rust
/// use rill_runtime::RuntimeConfig;
///
/// // Default configuration
/// let config = RuntimeConfig::default();
///
/// // Custom configuration for a batch workload
/// let config = RuntimeConfig {
///     arena_reserve: 8 << 30,
///     worker_threads: Some(16),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bytes of virtual address space reserved up front for the arena.
    ///
    /// Only reserved, not committed; the default is generous because the
    /// kind map needs every runtime pointer to fall inside this range.
    /// Default: 4 GiB
    pub arena_reserve: usize,

    /// Worker threads for `parallel_tabulate`.
    ///
    /// If None, auto-detects the number of CPUs.
    /// Default: None
    pub worker_threads: Option<usize>,

    /// Soft cap on the number of invocations kept in the LRU list before
    /// eviction is attempted.
    /// Default: 65536
    pub lru_capacity: usize,

    /// Emit a statistics report when an obstack is destroyed.
    /// Default: false
    pub verbose: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            arena_reserve: 4 << 30,
            worker_threads: None,
            lru_capacity: 65536,
            verbose: false,
        }
    }
}

impl RuntimeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.arena_reserve < 1 << 20 {
            return Err(RuntimeError::Configuration(
                "arena_reserve too small for even a handful of chunks".into(),
            ));
        }
        if let Some(n) = self.worker_threads {
            if n == 0 {
                return Err(RuntimeError::Configuration(
                    "worker_threads must be nonzero when set".into(),
                ));
            }
        }
        Ok(())
    }

    /// The effective number of worker threads.
    pub fn effective_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }
}
