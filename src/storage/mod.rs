//! Filesystem tier storage management
//!
//! [`StorageMonitor`] keeps per-file access statistics and classifies disk
//! usage; [`EvictionEngine`] removes files when usage runs high.

pub mod eviction;
pub mod monitor;

pub use eviction::{
    EvictionConfig, EvictionEngine, EvictionPolicy, EvictionRecommendations, EvictionResult,
    EvictionStrategy,
};
pub use monitor::{
    AccessPattern, StorageConfig, StorageMonitor, StorageStats, StorageStatus, ThresholdReport,
};
