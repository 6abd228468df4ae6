//! Multi-Tier Cache
//!
//! A facade over a bounded in-process memory tier and an optional networked
//! key-value tier (Redis).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           CacheManager (facade)                           │
//! │        backend selection · write-back · stats · best-effort writes        │
//! ├───────────────────────────────────┬──────────────────────────────────────┤
//! │  MemoryTier                       │  RemoteTier                          │
//! │  ┌─────────────────────────────┐  │  ┌────────────────────────────────┐  │
//! │  │ RwLock<HashMap>             │  │  │ ConnectionStateMachine         │  │
//! │  │ lazy TTL + periodic sweep   │  │  │ exponential reconnect backoff  │  │
//! │  │ approximate-LRU eviction    │  │  │ per-call timeouts              │  │
//! │  └─────────────────────────────┘  │  └──────────────┬─────────────────┘  │
//! │                                   │                 │                    │
//! │                                   │        dyn RemoteStore               │
//! │                                   │   (RedisStore / InMemoryRemoteStore) │
//! └───────────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Failure Model
//!
//! The cache is never the system of record. Tier failures are counted and
//! logged, then degraded to a miss or a no-op; nothing thrown at runtime
//! reaches the caller.

mod clock;
mod config;
mod entry;
mod manager;
mod memory;
mod selector;
mod stats;
pub mod remote;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendConfig, PreferredBackend, ReconnectConfig, RemoteConfig};
pub use entry::CacheEntry;
pub use manager::{CacheItem, CacheManager};
pub use memory::{MemoryTier, MemoryTierConfig, MemoryTierStats};
pub use remote::{
    ConnectionState, InMemoryRemoteStore, RedisStore, RemoteStore, RemoteTier, RemoteTierConfig,
    RemoteTierStats,
};
pub use selector::{BackendSelector, BackendType, RemoteAvailability};
pub use stats::{BackendStatus, CacheStats, RunningAverage, StatsCollector, TierFigures};

/// Default entry TTL in seconds
pub const DEFAULT_TTL_SECONDS: u64 = 300;

/// Default memory tier capacity in entries
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Default expiry sweep period in milliseconds
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;

/// Default share of capacity evicted per pass
pub const DEFAULT_EVICTION_FRACTION: f64 = 0.1;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_TTL_SECONDS, 300);
        assert_eq!(DEFAULT_MAX_ENTRIES, 1000);
        assert_eq!(DEFAULT_CLEANUP_INTERVAL_MS, 60_000);
        assert!(DEFAULT_EVICTION_FRACTION > 0.0 && DEFAULT_EVICTION_FRACTION <= 0.2);
    }
}
