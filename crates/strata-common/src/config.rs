//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ATTR_ITEM_TARGET_SIZE, DEFAULT_MAINTENANCE_WORK_MEM,
};

/// Tunable parameters of the storage engine.
///
/// # Example
///
/// ```rust
/// use strata_common::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_maintenance_work_mem(8 * 1024 * 1024)
///     .with_compression(false);
/// assert!(!config.enable_compression);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Memory budget for one vacuum round's dead-TID set, in bytes.
    pub maintenance_work_mem: usize,

    /// Whether attribute item payloads are offered to the compressor.
    pub enable_compression: bool,

    /// Target uncompressed payload size for one attribute array item.
    pub attr_item_target_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            maintenance_work_mem: DEFAULT_MAINTENANCE_WORK_MEM,
            enable_compression: true,
            attr_item_target_size: DEFAULT_ATTR_ITEM_TARGET_SIZE,
        }
    }
}

impl EngineConfig {
    /// Sets the vacuum memory budget.
    #[must_use]
    pub fn with_maintenance_work_mem(mut self, bytes: usize) -> Self {
        self.maintenance_work_mem = bytes;
        self
    }

    /// Enables or disables payload compression.
    #[must_use]
    pub fn with_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    /// Sets the attribute item target payload size.
    #[must_use]
    pub fn with_attr_item_target_size(mut self, bytes: usize) -> Self {
        self.attr_item_target_size = bytes;
        self
    }
}
