//! Multi-Tier Cache
//!
//! Ordered cache tiers behind a single orchestrator:
//!
//! - **Memory**: in-process, bounded, lowest latency
//! - **Redis**: networked key-value store shared between processes
//! - **Filesystem**: durable data + sidecar files, bounded by eviction
//!
//! ```text
//! get ──▶ memory ──miss──▶ redis ──miss──▶ filesystem
//!           ▲                ▲                 │ hit
//!           └──── backfill ──┴─────────────────┘
//! ```

pub mod entry;
pub mod filesystem;
pub mod index;
pub mod key;
pub mod memory;
pub mod orchestrator;
pub mod popularity;
pub mod redis;
pub mod tier;

pub use entry::{CacheEntry, EntryMetadata};
pub use filesystem::{FilesystemTier, FilesystemTierConfig};
pub use index::NamespaceIndex;
pub use key::{CacheKey, KeyStrategy, Params};
pub use memory::{MemoryTier, MemoryTierConfig};
pub use orchestrator::{AggregateStats, CacheHit, MultiTierCache, PreloadReport, SetOutcome, TierReport};
pub use popularity::PopularityCounter;
pub use redis::{RedisTier, RedisTierConfig};
pub use tier::{CacheTier, CacheTierStats, TierCounters};
