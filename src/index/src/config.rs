//! Tunables for the index. Every field has a default so a config source
//! only needs to name what it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of partitions series keys are hashed across.
    pub partition_count: usize,
    /// A log file is sealed once it reaches this many bytes.
    pub max_log_file_size: u64,
    /// Index file count per partition that triggers a full merge.
    pub max_index_files: usize,
    /// How often each partition checks for compaction work.
    pub compact_interval_ms: u64,
    /// Initial and maximum delay after a failed compaction.
    pub compact_backoff_ms: u64,
    pub compact_backoff_max_ms: u64,
    /// Tombstones accumulated in sealed series segments before the series
    /// file is rewritten.
    pub series_compact_threshold: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            partition_count: num_cpus::get().clamp(1, 8),
            max_log_file_size: 1 << 20,
            max_index_files: 8,
            compact_interval_ms: 10_000,
            compact_backoff_ms: 100,
            compact_backoff_max_ms: 10_000,
            series_compact_threshold: 1 << 17,
        }
    }
}

impl IndexConfig {
    pub fn compact_interval(&self) -> Duration {
        Duration::from_millis(self.compact_interval_ms)
    }

    pub fn compact_backoff(&self) -> Duration {
        Duration::from_millis(self.compact_backoff_ms)
    }

    pub fn compact_backoff_max(&self) -> Duration {
        Duration::from_millis(self.compact_backoff_max_ms)
    }
}
