//! Disk queue configuration.

use std::path::PathBuf;

/// Queue files below this capacity are not worth the bookkeeping.
pub const MIN_CAPACITY_BYTES: i64 = 1024 * 1024;

const DEFAULT_FRONT_CACHE_SIZE: usize = 1000;
const DEFAULT_FLOW_CONTROL_WINDOW_SIZE: usize = 1000;
const DEFAULT_TRUNCATE_SIZE_RATIO: f64 = 1.0;

/// The pre-v4 truncation default kept for compatibility configs.
pub const COMPAT_TRUNCATE_SIZE_RATIO: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct DiskQueueOptions {
    /// Maximum size of the ring file in bytes.
    pub capacity_bytes: i64,
    /// In-memory messages served ahead of the ring.
    pub front_cache_size: usize,
    /// In-memory tail entries accepted when the ring is full
    /// (non-reliable).
    pub flow_control_window_size: usize,
    /// In-memory tail bytes accepted when the ring is full (reliable).
    pub flow_control_window_bytes: i64,
    pub reliable: bool,
    pub read_only: bool,
    /// None means "use the default"; an explicit setting wins conflicts.
    pub prealloc: Option<bool>,
    pub truncate_size_ratio: Option<f64>,
    pub dir: PathBuf,
}

impl Default for DiskQueueOptions {
    fn default() -> Self {
        DiskQueueOptions {
            capacity_bytes: MIN_CAPACITY_BYTES,
            front_cache_size: DEFAULT_FRONT_CACHE_SIZE,
            flow_control_window_size: DEFAULT_FLOW_CONTROL_WINDOW_SIZE,
            flow_control_window_bytes: 16 * 1024 * 1024,
            reliable: false,
            read_only: false,
            prealloc: None,
            truncate_size_ratio: None,
            dir: PathBuf::from("."),
        }
    }
}

/// Effective settings after defaulting and conflict resolution.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub options: DiskQueueOptions,
    pub prealloc: bool,
    pub truncate_size_ratio: f64,
}

impl DiskQueueOptions {
    /// Apply the capacity floor and resolve the preallocation/truncation
    /// conflict: the two are mutually exclusive, an explicitly configured
    /// side wins, and preallocation wins ties.
    pub fn resolve(mut self) -> ResolvedOptions {
        if self.capacity_bytes > 0 && self.capacity_bytes < MIN_CAPACITY_BYTES {
            tracing::warn!(
                min_space = MIN_CAPACITY_BYTES,
                "the configured capacity is too low, raising it to the smallest acceptable value"
            );
            self.capacity_bytes = MIN_CAPACITY_BYTES;
        }

        let prealloc_explicit = self.prealloc.is_some();
        let ratio_explicit = self.truncate_size_ratio.is_some();
        let mut prealloc = self.prealloc.unwrap_or(false);
        let mut ratio = self
            .truncate_size_ratio
            .unwrap_or(DEFAULT_TRUNCATE_SIZE_RATIO);

        if prealloc && ratio < 1.0 {
            if ratio_explicit && prealloc_explicit {
                tracing::error!(
                    "preallocation and truncation cannot be enabled at the same time, disabling preallocation"
                );
                prealloc = false;
            } else if ratio_explicit {
                tracing::warn!(
                    "preallocation and truncation cannot be enabled at the same time, preallocation disabled"
                );
                prealloc = false;
            } else {
                tracing::warn!(
                    "preallocation and truncation cannot be enabled at the same time, truncation disabled"
                );
                ratio = 1.0;
            }
        }

        ResolvedOptions {
            options: self,
            prealloc,
            truncate_size_ratio: ratio,
        }
    }
}
