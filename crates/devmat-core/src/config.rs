//! Engine-wide runtime configuration.
//!
//! The engine reads a process-wide [`EngineConfig`] at every kernel launch.
//! It can be replaced wholesale with [`set_engine_config`] or adjusted through
//! the builder.

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Default number of elements summed sequentially inside one reduction block.
pub const DEFAULT_REDUCTION_BLOCK: usize = 1024;

/// Default minimum number of elements per parallel task.
pub const DEFAULT_PARALLEL_MIN_LEN: usize = 4096;

/// Runtime settings shared by every device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Wait for each kernel launch to complete before returning
    pub sync_launches: bool,
    /// Elements per reduction block. Fixed per process so results are
    /// reproducible regardless of thread count.
    pub reduction_block: usize,
    /// Below this many elements kernels run on the calling thread
    pub parallel_min_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_launches: true,
            reduction_block: DEFAULT_REDUCTION_BLOCK,
            parallel_min_len: if cfg!(feature = "parallel") {
                DEFAULT_PARALLEL_MIN_LEN
            } else {
                usize::MAX
            },
        }
    }
}

impl EngineConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Whether a kernel over `len` elements should be split across threads.
    pub fn should_parallelize(&self, len: usize) -> bool {
        len >= self.parallel_min_len
    }
}

/// Builder for creating a custom engine configuration.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether launches synchronise.
    pub fn sync_launches(mut self, sync: bool) -> Self {
        self.config.sync_launches = sync;
        self
    }

    /// Set the reduction block size. Zero is raised to one.
    pub fn reduction_block(mut self, block: usize) -> Self {
        self.config.reduction_block = block.max(1);
        self
    }

    /// Set the minimum parallel task length.
    pub fn parallel_min_len(mut self, len: usize) -> Self {
        self.config.parallel_min_len = len.max(1);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

static ENGINE_CONFIG: Lazy<RwLock<EngineConfig>> = Lazy::new(|| RwLock::new(EngineConfig::default()));

/// Snapshot of the current engine configuration.
pub fn engine_config() -> EngineConfig {
    ENGINE_CONFIG.read().clone()
}

/// Replace the engine configuration.
pub fn set_engine_config(config: EngineConfig) {
    *ENGINE_CONFIG.write() = config;
}

/// Toggle synchronous launches.
pub fn set_sync_launches(sync: bool) {
    ENGINE_CONFIG.write().sync_launches = sync;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .sync_launches(false)
            .reduction_block(0)
            .parallel_min_len(64)
            .build();
        assert!(!config.sync_launches);
        assert_eq!(config.reduction_block, 1);
        assert!(config.should_parallelize(64));
        assert!(!config.should_parallelize(63));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.sync_launches);
        assert_eq!(config.reduction_block, DEFAULT_REDUCTION_BLOCK);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_round_trip() {
        let config = EngineConfig::builder().reduction_block(256).build();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
