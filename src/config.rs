//! Tunables for the coordinator and its two tiers.
//!
//! Mirrors the `*Config` structs scattered through disk-cache implementations in
//! the wild: a plain, `Default`-able, `serde`-roundtrippable struct with documented
//! defaults rather than a builder with a dozen chained calls.

use std::time::Duration;

/// Values at or below this are inlined when the storage type is [`crate::item::StorageType::Mixed`].
pub const DEFAULT_INLINE_THRESHOLD: u64 = 20 * 1024;

/// How many rows a single LRU-eviction transaction removes before re-checking
/// the target. Caps per-transaction work so a large eviction doesn't hold a
/// single SQLite transaction open for too long.
pub const EVICTION_BATCH_SIZE: usize = 16;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryCacheOptions {
    pub count_limit: usize,
    pub cost_limit: u64,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Duration,
    /// Evict everything on a host-delivered low-memory signal. Advisory: this
    /// crate never listens for the signal itself, callers wire it to
    /// [`crate::memory::MemoryCache::on_low_memory`].
    pub evict_on_low_memory: bool,
    /// Evict everything when the host process is backgrounded. Same caveat
    /// as `evict_on_low_memory`.
    pub evict_on_backgrounded: bool,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            count_limit: usize::MAX,
            cost_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(5),
            evict_on_low_memory: false,
            evict_on_backgrounded: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiskCacheOptions {
    pub count_limit: u64,
    pub size_limit: u64,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Duration,
    pub inline_threshold: u64,
    pub error_logs_enabled: bool,
}

impl Default for DiskCacheOptions {
    fn default() -> Self {
        Self {
            count_limit: u64::MAX,
            size_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(60),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            error_logs_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CoordinatorOptions {
    pub memory: MemoryCacheOptions,
    pub disk: DiskCacheOptions,
}
