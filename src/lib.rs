//! tiercache - Multi-Tier Cache
//!
//! A cache facade combining a bounded in-process memory tier with an
//! optional shared Redis tier. Callers see one get/set/delete surface; the
//! facade handles backend selection, failover to memory when the remote tier
//! is down, TTL expiry, bounded-size eviction and reconnect backoff.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ CacheManager ──▶ MemoryTier (hot path)
//!                  │
//!                  └────────▶ RemoteTier ──▶ RemoteStore (Redis)
//! ```
//!
//! The cache is never the system of record: every runtime failure degrades
//! to a miss and shows up only in [`CacheStats`](cache::CacheStats).
//!
//! # Example
//!
//! ```no_run
//! use tiercache::cache::{BackendConfig, CacheManager};
//!
//! # async fn run() -> tiercache::Result<()> {
//! let cache = CacheManager::new(BackendConfig::memory_only()).await?;
//! cache.set("user:42", &"Ann", 60).await;
//! let name: Option<String> = cache.get("user:42").await;
//! assert_eq!(name.as_deref(), Some("Ann"));
//! cache.destroy().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, backend selection and the facade
//! - [`error`] - Error types
//! - [`monitoring`] - Health checks and Prometheus exposition

pub mod cache;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{BackendConfig, BackendType, CacheManager, CacheStats, ConnectionState};
pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
