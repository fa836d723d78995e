//! Configuration for the tablet allocator and transition driver.

use crate::types::TableId;
use std::collections::HashMap;

/// Default target size of one tablet, in bytes.
pub const DEFAULT_TARGET_TABLET_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Configuration for the tablet allocator.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Target tablet size in bytes. A table whose average tablet size
    /// reaches this value gets a split decision; one quarter of it is the
    /// merge threshold.
    pub target_tablet_size: u64,

    /// Per-table overrides of the target tablet size.
    pub per_table_target_size: HashMap<TableId, u64>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            target_tablet_size: DEFAULT_TARGET_TABLET_SIZE,
            per_table_target_size: HashMap::new(),
        }
    }
}

impl AllocatorConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global target tablet size.
    pub fn with_target_tablet_size(mut self, bytes: u64) -> Self {
        self.target_tablet_size = bytes;
        self
    }

    /// Override the target tablet size of one table.
    pub fn with_table_target_size(mut self, table: TableId, bytes: u64) -> Self {
        self.per_table_target_size.insert(table, bytes);
        self
    }

    /// The effective target tablet size of a table.
    pub fn target_size_for(&self, table: TableId) -> u64 {
        self.per_table_target_size
            .get(&table)
            .copied()
            .unwrap_or(self.target_tablet_size)
    }

    /// The size below which a table's tablets should merge.
    pub fn merge_threshold_for(&self, table: TableId) -> u64 {
        self.target_size_for(table) / 4
    }
}

/// Configuration for the per-tablet transition driver.
#[derive(Debug, Clone)]
pub struct TransitionConfig {
    /// How many times streaming is retried on a fresh session before the
    /// failure becomes fatal. Retries only happen before the read switch.
    pub max_streaming_retries: usize,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            max_streaming_retries: 3,
        }
    }
}

impl TransitionConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the streaming retry budget.
    pub fn with_max_streaming_retries(mut self, retries: usize) -> Self {
        self.max_streaming_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_size_override() {
        let table = TableId::random();
        let other = TableId::random();
        let config = AllocatorConfig::new()
            .with_target_tablet_size(1024)
            .with_table_target_size(table, 4096);

        assert_eq!(config.target_size_for(table), 4096);
        assert_eq!(config.target_size_for(other), 1024);
        assert_eq!(config.merge_threshold_for(table), 1024);
        assert_eq!(config.merge_threshold_for(other), 256);
    }
}
