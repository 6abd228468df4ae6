//! Memory Tier - bounded in-process cache
//!
//! # Design
//!
//! - Single `RwLock<HashMap>`: reads share the lock, every mutation is exclusive
//! - Lazy expiry on `get`, plus a cancellable periodic sweep so keys that are
//!   never read again still get dropped
//! - Approximate LRU: once the entry count passes `max_entries`, the least
//!   recently accessed `eviction_fraction` of capacity is evicted in one pass
//!   under the same write lock as the insert that overflowed

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::entry::CacheEntry;
use super::{DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_EVICTION_FRACTION, DEFAULT_MAX_ENTRIES};

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    /// Live entry bound
    pub max_entries: usize,
    /// Share of `max_entries` evicted per capacity pass, in (0, 1]
    pub eviction_fraction: f64,
    /// Expiry sweep period
    pub cleanup_interval: Duration,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            eviction_fraction: DEFAULT_EVICTION_FRACTION,
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
        }
    }
}

impl MemoryTierConfig {
    /// Entries removed by one capacity pass (at least one)
    pub fn eviction_batch(&self) -> usize {
        ((self.max_entries as f64 * self.eviction_fraction).ceil() as usize).max(1)
    }
}

struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Bounded, TTL-aware in-process cache tier
pub struct MemoryTier {
    /// Entries by key
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// Configuration
    config: MemoryTierConfig,
    /// Time source for timestamps and expiry
    clock: Arc<dyn Clock>,
    /// Insertion counter
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    /// Background sweep task, if running
    sweeper: Mutex<Option<Sweeper>>,
    /// Set by `close`; flipped under the entries write lock
    closed: AtomicBool,
}

impl MemoryTier {
    /// Create a memory tier with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryTierConfig::default())
    }

    /// Create a memory tier on the wall clock
    pub fn with_config(config: MemoryTierConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a memory tier on an explicit clock
    pub fn with_clock(config: MemoryTierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            clock,
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Get a live entry's payload, recording the access
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now_millis();

        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired_at(now) => {
                    entry.record_access(now);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value().clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: drop it, unless a writer replaced it in the meantime
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.is_expired_at(now)) {
            entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "memory tier lazy expiry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite an entry. Never fails; may trigger eviction.
    pub fn set(&self, key: &str, value: Bytes, ttl_seconds: u64) {
        let now = self.clock.now_millis();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry::new(key, value, ttl_seconds, now, sequence);

        let mut entries = self.entries.write();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        entries.insert(key.to_string(), entry);

        if entries.len() > self.config.max_entries {
            self.evict_locked(&mut entries, now);
        }
    }

    /// Remove an entry; returns whether one was present
    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Whether a live entry exists (does not count as an access)
    pub fn exists(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop every entry and refuse all later inserts. Writers racing with
    /// this either land before it and get cleared, or are discarded.
    pub fn close(&self) {
        let mut entries = self.entries.write();
        self.closed.store(true, Ordering::SeqCst);
        entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Capacity pass. Expired entries go first; if still over the bound, the
    /// oldest-accessed batch is removed.
    fn evict_locked(&self, entries: &mut HashMap<String, CacheEntry>, now: u64) {
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        let expired = before - entries.len();
        if expired > 0 {
            self.expirations
                .fetch_add(expired as u64, Ordering::Relaxed);
        }

        let overflow = entries.len().saturating_sub(self.config.max_entries);
        if overflow == 0 {
            return;
        }
        let batch = overflow.max(self.config.eviction_batch()).min(entries.len());

        let mut candidates: Vec<(u64, u64, String)> = entries
            .values()
            .map(|e| (e.last_accessed_at(), e.sequence(), e.key().to_string()))
            .collect();
        candidates.sort_unstable();

        for (_, _, key) in candidates.into_iter().take(batch) {
            entries.remove(&key);
        }
        self.evictions.fetch_add(batch as u64, Ordering::Relaxed);

        debug!(
            evicted = batch,
            expired,
            remaining = entries.len(),
            "memory tier capacity eviction"
        );
    }

    /// Remove every expired entry; returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "memory tier sweep");
        }
        removed
    }

    /// Start the periodic expiry sweep. No-op if already running.
    ///
    /// The task only holds a weak reference, so dropping the last `Arc`
    /// also ends the loop.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tier: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(tier) = tier.upgrade() else { break };
                        tier.sweep_expired();
                    }
                }
            }
        });

        info!(interval_ms = period.as_millis() as u64, "memory tier sweeper started");
        *slot = Some(Sweeper { cancel, task });
    }

    /// Cancel the sweep and wait for it to finish. Idempotent.
    pub async fn stop_sweeper(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            let _ = sweeper.task.await;
            debug!("memory tier sweeper stopped");
        }
    }

    /// Whether the sweep task is running
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Number of stored entries (expired ones included until swept)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn config(&self) -> &MemoryTierConfig {
        &self.config
    }

    /// Access metadata for a stored entry: (access_count, last_accessed_at)
    pub fn access_info(&self, key: &str) -> Option<(u64, u64)> {
        self.entries
            .read()
            .get(key)
            .map(|e| (e.access_count(), e.last_accessed_at()))
    }

    /// Tier-local counters
    pub fn stats(&self) -> MemoryTierStats {
        MemoryTierStats {
            entries: self.len(),
            max_entries: self.config.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryTier {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.cancel.cancel();
        }
    }
}

/// Memory tier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTierStats {
    /// Stored entries
    pub entries: usize,
    /// Capacity in entries
    pub max_entries: usize,
    /// Tier-local hits
    pub hits: u64,
    /// Tier-local misses
    pub misses: u64,
    /// Entries removed by capacity passes
    pub evictions: u64,
    /// Entries removed because their TTL ran out
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use proptest::prelude::*;

    fn make_tier(max_entries: usize, clock: Arc<ManualClock>) -> MemoryTier {
        let config = MemoryTierConfig {
            max_entries,
            eviction_fraction: 0.2,
            cleanup_interval: Duration::from_secs(60),
        };
        MemoryTier::with_clock(config, clock)
    }

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_memory_tier_creation() {
        let tier = MemoryTier::new();
        assert!(tier.is_empty());
        assert_eq!(tier.config().max_entries, 1000);
        assert_eq!(tier.stats(), MemoryTierStats {
            max_entries: 1000,
            ..MemoryTierStats::default()
        });
    }

    #[test]
    fn test_set_get() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(10, clock);

        tier.set("a", bytes("1"), 60);
        assert_eq!(tier.get("a"), Some(bytes("1")));
        assert_eq!(tier.get("missing"), None);

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_get_records_access() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(10, clock.clone());

        tier.set("a", bytes("1"), 60);
        assert_eq!(tier.access_info("a"), Some((0, 0)));

        clock.advance(Duration::from_millis(250));
        tier.get("a");
        tier.get("a");
        assert_eq!(tier.access_info("a"), Some((2, 250)));
    }

    #[test]
    fn test_overwrite_in_place() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(10, clock);

        tier.set("a", bytes("old"), 60);
        tier.get("a");
        tier.set("a", bytes("new"), 60);

        assert_eq!(tier.len(), 1);
        assert_eq!(tier.get("a"), Some(bytes("new")));
        // Overwrite resets access metadata
        assert_eq!(tier.access_info("a").map(|(count, _)| count), Some(1));
    }

    #[test]
    fn test_lazy_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(10, clock.clone());

        tier.set("user:42", bytes("{\"name\":\"Ann\"}"), 5);
        assert!(tier.get("user:42").is_some());

        clock.advance(Duration::from_secs(6));
        assert!(!tier.exists("user:42"));
        assert_eq!(tier.get("user:42"), None);
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.stats().expirations, 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(10, clock);

        tier.set("a", bytes("1"), 60);
        tier.set("b", bytes("2"), 60);
        assert!(tier.delete("a"));
        assert!(!tier.delete("a"));
        assert!(!tier.exists("a"));
        assert!(tier.exists("b"));

        tier.clear();
        assert!(tier.is_empty());
    }

    #[test]
    fn test_close_refuses_later_inserts() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(10, clock);

        tier.set("a", bytes("1"), 60);
        tier.close();
        assert!(tier.is_closed());
        assert!(tier.is_empty());

        tier.set("b", bytes("2"), 60);
        assert!(tier.is_empty());
        assert_eq!(tier.get("b"), None);
    }

    #[test]
    fn test_sweep_removes_unread_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(100, clock.clone());

        for i in 0..10 {
            tier.set(&format!("short-{}", i), bytes("x"), 1);
        }
        tier.set("long", bytes("y"), 600);

        clock.advance(Duration::from_secs(2));
        assert_eq!(tier.sweep_expired(), 10);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.stats().expirations, 10);
        assert_eq!(tier.sweep_expired(), 0);
    }

    #[test]
    fn test_capacity_eviction_removes_least_recently_accessed() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(10, clock.clone());

        for i in 0..10 {
            tier.set(&format!("k{}", i), bytes("v"), 600);
            clock.advance(Duration::from_millis(10));
        }
        // Touch the two oldest so they become the most recent
        tier.get("k0");
        tier.get("k1");
        clock.advance(Duration::from_millis(10));

        tier.set("k10", bytes("v"), 600);

        // 20% of 10 = 2 evicted
        assert_eq!(tier.len(), 9);
        assert_eq!(tier.stats().evictions, 2);
        assert!(tier.exists("k0"));
        assert!(tier.exists("k1"));
        assert!(!tier.exists("k2"));
        assert!(!tier.exists("k3"));
        assert!(tier.exists("k10"));
    }

    #[test]
    fn test_eviction_prefers_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = make_tier(3, clock.clone());

        tier.set("stale", bytes("v"), 1);
        tier.set("a", bytes("v"), 600);
        tier.set("b", bytes("v"), 600);
        clock.advance(Duration::from_secs(2));

        tier.set("c", bytes("v"), 600);
        assert_eq!(tier.len(), 3);
        assert_eq!(tier.stats().evictions, 0);
        assert_eq!(tier.stats().expirations, 1);
        assert!(tier.exists("a") && tier.exists("b") && tier.exists("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_and_stops() {
        let clock = Arc::new(ManualClock::new(0));
        let config = MemoryTierConfig {
            max_entries: 100,
            eviction_fraction: 0.1,
            cleanup_interval: Duration::from_millis(100),
        };
        let tier = Arc::new(MemoryTier::with_clock(config, clock.clone()));
        tier.start_sweeper();
        assert!(tier.sweeper_running());

        tier.set("a", bytes("v"), 1);
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(tier.len(), 0);

        tier.stop_sweeper().await;
        assert!(!tier.sweeper_running());
        // Second stop is a no-op
        tier.stop_sweeper().await;

        // No sweeping after stop
        tier.set("b", bytes("v"), 1);
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_concurrent_access() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = Arc::new(make_tier(50, clock));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tier = tier.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("t{}-{}", t, i % 20);
                        tier.set(&key, bytes("v"), 60);
                        tier.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(tier.len() <= 50);
    }

    proptest! {
        #[test]
        fn prop_eviction_keeps_bound_and_recency_order(
            max_entries in 1usize..40,
            ops in proptest::collection::vec((0u8..60, any::<bool>()), 1..200),
        ) {
            let clock = Arc::new(ManualClock::new(0));
            let tier = make_tier(max_entries, clock.clone());

            for (key, read) in ops {
                clock.advance(Duration::from_millis(1));
                let key = format!("k{}", key);
                if read {
                    tier.get(&key);
                } else {
                    let before: Vec<(String, u64)> = {
                        let entries = tier.entries.read();
                        entries.values().map(|e| (e.key().to_string(), e.last_accessed_at())).collect()
                    };
                    tier.set(&key, bytes("v"), 600);
                    prop_assert!(tier.len() <= max_entries);

                    let entries = tier.entries.read();
                    let evicted: Vec<u64> = before
                        .iter()
                        .filter(|(k, _)| *k != key && !entries.contains_key(k))
                        .map(|(_, at)| *at)
                        .collect();
                    let newest_evicted = evicted.iter().max();
                    if let Some(newest_evicted) = newest_evicted {
                        for entry in entries.values().filter(|e| e.key() != key) {
                            prop_assert!(*newest_evicted <= entry.last_accessed_at());
                        }
                    }
                }
            }
        }
    }
}
