//! Cache Manager - Tiered Cache Facade
//!
//! The only cache surface callers see. Reads go memory first, then the
//! remote tier while it is connected, writing remote hits back into memory.
//! Writes go through to every active tier.
//!
//! # Design
//!
//! - Values cross the tier boundary as JSON bytes; the facade is generic
//!   over `Serialize`/`DeserializeOwned` payloads
//! - Runtime operations return plain values. Encode/decode failures and
//!   remote failures are counted in stats and logged, never returned
//! - A miss in every tier counts as one miss
//! - The handle is built once at startup and shared by reference; there is
//!   no global instance

use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::config::{BackendConfig, PreferredBackend, RemoteConfig};
use super::memory::{MemoryTier, MemoryTierConfig};
use super::remote::{ConnectionState, RedisStore, RemoteStore, RemoteTier, RemoteTierConfig};
use super::selector::{BackendSelector, BackendType, RemoteAvailability};
use super::stats::{BackendStatus, CacheStats, LatencyTracker, StatsCollector, TierFigures};
use crate::error::{Error, Result};

/// One entry of a batch write
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem<T> {
    pub key: String,
    pub value: T,
    /// Falls back to the default TTL when unset
    pub ttl_seconds: Option<u64>,
}

impl<T> CacheItem<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
            ttl_seconds: None,
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }
}

/// Tiered cache facade
pub struct CacheManager {
    /// Configuration
    config: BackendConfig,
    /// Active backend set, fixed at construction
    backend: BackendType,
    /// Memory tier, when active
    memory: Option<Arc<MemoryTier>>,
    /// Remote tier, when active
    remote: Option<Arc<RemoteTier>>,
    /// Facade counters
    stats: StatsCollector,
    destroyed: AtomicBool,
}

impl CacheManager {
    /// Build the cache from configuration, using Redis for the remote tier.
    ///
    /// Fails only on invalid configuration. An unreachable remote endpoint
    /// is not an error: `auto` falls back to memory, `remote` starts degraded.
    pub async fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;

        let store: Option<Arc<dyn RemoteStore>> = match (&config.remote, config.preferred_backend)
        {
            (Some(remote), PreferredBackend::Auto | PreferredBackend::Remote) => {
                Some(Arc::new(RedisStore::open(&remote.url)?))
            }
            _ => None,
        };

        Self::with_parts(config, store, Arc::new(SystemClock)).await
    }

    /// Build the cache around an explicit remote store and clock.
    ///
    /// A supplied store counts as a configured endpoint even when
    /// `config.remote` is unset (default key prefix and timeouts apply).
    #[instrument(skip_all, fields(preferred = %config.preferred_backend))]
    pub async fn with_parts(
        mut config: BackendConfig,
        store: Option<Arc<dyn RemoteStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = match config.preferred_backend {
            PreferredBackend::Memory => None,
            PreferredBackend::Auto | PreferredBackend::Remote => store,
        };
        if store.is_some() && config.remote.is_none() {
            config.remote = Some(RemoteConfig::default());
        }
        config.validate()?;

        let remote = match (&store, &config.remote) {
            (Some(store), Some(remote_config)) => Some(RemoteTier::new(
                Arc::clone(store),
                RemoteTierConfig::from_config(remote_config, &config.reconnect),
            )),
            _ => None,
        };

        let availability = match &remote {
            None => RemoteAvailability::NotConfigured,
            Some(tier) => {
                if tier.connect().await {
                    RemoteAvailability::Reachable
                } else {
                    RemoteAvailability::Unreachable
                }
            }
        };

        let backend = BackendSelector::select(
            config.preferred_backend,
            config.enable_memory_cache,
            availability,
        )?;

        let remote = match remote {
            Some(tier) if backend.uses_remote() => Some(tier),
            Some(tier) => {
                warn!(
                    store = tier.store_name(),
                    "remote tier unreachable at startup, continuing memory-only"
                );
                tier.shutdown().await;
                None
            }
            None => None,
        };

        let memory = backend.uses_memory().then(|| {
            let tier = Arc::new(MemoryTier::with_clock(
                MemoryTierConfig {
                    max_entries: config.max_entries,
                    eviction_fraction: config.eviction_fraction,
                    cleanup_interval: config.cleanup_interval(),
                },
                clock,
            ));
            tier.start_sweeper();
            tier
        });

        info!(
            backend = %backend,
            remote_state = %remote.as_ref().map_or(ConnectionState::Disabled, |r| r.state()),
            max_entries = config.max_entries,
            default_ttl_seconds = config.default_ttl_seconds,
            "cache initialized"
        );

        Ok(Self {
            config,
            backend,
            memory,
            remote,
            stats: StatsCollector::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Look a key up across the active tiers
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.is_destroyed() {
            return None;
        }

        let tracker = LatencyTracker::start();
        let value = self.lookup(key).await;
        self.stats.record_latency(tracker.elapsed());

        match value {
            Some(_) => self.stats.record_hit(),
            None => {
                self.stats.record_miss();
                debug!(key, "cache miss");
            }
        }
        value
    }

    /// Store a value in every active tier. `ttl_seconds == 0` means the
    /// default TTL.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_seconds: u64) {
        if self.is_destroyed() {
            return;
        }

        let Some(bytes) = self.encode(key, value) else {
            return;
        };
        let ttl = self.effective_ttl(ttl_seconds);

        if let Some(memory) = &self.memory {
            memory.set(key, bytes.clone(), ttl);
        }
        if let Some(remote) = &self.remote {
            remote.set(key, bytes, ttl).await;
        }
    }

    /// Remove a key from every active tier
    pub async fn delete(&self, key: &str) {
        if self.is_destroyed() {
            return;
        }
        if let Some(memory) = &self.memory {
            memory.delete(key);
        }
        if let Some(remote) = &self.remote {
            remote.delete(key).await;
        }
    }

    /// Whether any active tier holds the key (memory first)
    pub async fn exists(&self, key: &str) -> bool {
        if self.is_destroyed() {
            return false;
        }
        if self.memory.as_ref().is_some_and(|m| m.exists(key)) {
            return true;
        }
        match &self.remote {
            Some(remote) => remote.exists(key).await,
            None => false,
        }
    }

    /// Look many keys up. The result is positionally aligned with `keys`.
    /// Memory misses are fetched from the remote tier in one batch.
    pub async fn mget<T, K>(&self, keys: &[K]) -> Vec<Option<T>>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        if self.is_destroyed() {
            return keys.iter().map(|_| None).collect();
        }

        let tracker = LatencyTracker::start();
        let mut results: Vec<Option<T>> = Vec::with_capacity(keys.len());
        let mut pending: Vec<usize> = Vec::new();

        for (index, key) in keys.iter().enumerate() {
            let value = match self.memory_lookup(key.as_ref()) {
                MemoryLookup::Found(value) => Some(value),
                MemoryLookup::Undecodable => None,
                MemoryLookup::Absent => {
                    pending.push(index);
                    None
                }
            };
            results.push(value);
        }

        if let Some(remote) = self.connected_remote().filter(|_| !pending.is_empty()) {
            let remote_keys: Vec<String> = pending
                .iter()
                .map(|&index| keys[index].as_ref().to_string())
                .collect();
            let values = remote.mget(&remote_keys).await;

            for ((&index, key), value) in pending.iter().zip(&remote_keys).zip(values) {
                if let Some(bytes) = value {
                    results[index] = self.accept_remote(key, bytes);
                }
            }
        }

        self.stats.record_latency(tracker.elapsed());
        for value in &results {
            match value {
                Some(_) => self.stats.record_hit(),
                None => self.stats.record_miss(),
            }
        }
        results
    }

    /// Store many values. Entries that fail to encode are skipped and
    /// counted; the rest go to the remote tier as one pipelined batch.
    pub async fn mset<T: Serialize>(&self, items: &[CacheItem<T>]) {
        if self.is_destroyed() || items.is_empty() {
            return;
        }

        let mut batch: Vec<(String, Bytes, u64)> = Vec::with_capacity(items.len());
        for item in items {
            let Some(bytes) = self.encode(&item.key, &item.value) else {
                continue;
            };
            let ttl = self.effective_ttl(item.ttl_seconds.unwrap_or(0));
            if let Some(memory) = &self.memory {
                memory.set(&item.key, bytes.clone(), ttl);
            }
            batch.push((item.key.clone(), bytes, ttl));
        }

        if let Some(remote) = &self.remote {
            remote.mset(&batch).await;
        }
    }

    /// Drop every entry from the memory tier and this cache's namespace in
    /// the remote tier
    pub async fn clear(&self) {
        if self.is_destroyed() {
            return;
        }
        if let Some(memory) = &self.memory {
            memory.clear();
        }
        if let Some(remote) = &self.remote {
            remote.clear().await;
        }
        info!(backend = %self.backend, "cache cleared");
    }

    /// Return the cached value, or compute it, cache it best-effort and
    /// return it
    pub async fn get_or_insert_with<T, F, Fut>(&self, key: &str, ttl_seconds: u64, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let result = self
            .get_or_try_insert_with(key, ttl_seconds, move || async move {
                Ok::<T, Infallible>(compute().await)
            })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with) for fallible
    /// sources; an error is returned as-is and nothing is cached
    pub async fn get_or_try_insert_with<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_seconds: u64,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, &value, ttl_seconds).await;
        Ok(value)
    }

    /// Aggregate statistics across the facade and its tiers
    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.as_ref().map(|m| m.stats()).unwrap_or_default();
        let remote_errors = self.remote.as_ref().map_or(0, |r| r.stats().errors);

        let status = match &self.remote {
            Some(remote) => BackendStatus::from_connection(remote.state()),
            None => BackendStatus::Connected,
        };

        self.stats.snapshot(
            self.backend,
            status,
            TierFigures {
                errors: remote_errors,
                evictions: memory.evictions,
                expirations: memory.expirations,
                memory_entries: memory.entries,
            },
        )
    }

    /// Active backend set
    pub fn backend_type(&self) -> BackendType {
        self.backend
    }

    /// Remote connection state; `Disabled` when no remote tier is active
    pub fn connection_state(&self) -> ConnectionState {
        self.remote
            .as_ref()
            .map_or(ConnectionState::Disabled, |r| r.state())
    }

    /// Entries held by the memory tier
    pub fn memory_len(&self) -> usize {
        self.memory.as_ref().map_or(0, |m| m.len())
    }

    /// Remote tier handle, when active
    pub fn remote(&self) -> Option<&Arc<RemoteTier>> {
        self.remote.as_ref()
    }

    /// Memory tier handle, when active
    pub fn memory(&self) -> Option<&Arc<MemoryTier>> {
        self.memory.as_ref()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Stop the sweep, cancel any pending reconnect, release the remote
    /// connection and clear memory. Safe to call more than once.
    #[instrument(skip(self), fields(backend = %self.backend))]
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(memory) = &self.memory {
            memory.stop_sweeper().await;
            memory.close();
        }
        if let Some(remote) = &self.remote {
            remote.shutdown().await;
        }
        info!("cache destroyed");
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.memory_lookup(key) {
            MemoryLookup::Found(value) => return Some(value),
            MemoryLookup::Undecodable => return None,
            MemoryLookup::Absent => {}
        }

        let remote = self.connected_remote()?;
        let bytes = remote.get(key).await?;
        self.accept_remote(key, bytes)
    }

    fn memory_lookup<T: DeserializeOwned>(&self, key: &str) -> MemoryLookup<T> {
        let Some(bytes) = self.memory.as_ref().and_then(|m| m.get(key)) else {
            return MemoryLookup::Absent;
        };
        match self.decode(key, &bytes) {
            Some(value) => MemoryLookup::Found(value),
            None => MemoryLookup::Undecodable,
        }
    }

    /// Decode a remote hit and write it back into memory
    fn accept_remote<T: DeserializeOwned>(&self, key: &str, bytes: Bytes) -> Option<T> {
        let value = self.decode(key, &bytes)?;
        if self.is_destroyed() {
            return Some(value);
        }
        if let Some(memory) = &self.memory {
            memory.set(key, bytes, self.config.default_ttl_seconds);
            debug!(key, "remote hit written back to memory");
        }
        Some(value)
    }

    fn connected_remote(&self) -> Option<&Arc<RemoteTier>> {
        self.remote.as_ref().filter(|r| r.is_connected())
    }

    fn effective_ttl(&self, ttl_seconds: u64) -> u64 {
        if ttl_seconds == 0 {
            self.config.default_ttl_seconds
        } else {
            ttl_seconds
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Option<Bytes> {
        match serde_json::to_vec(value) {
            Ok(raw) => Some(Bytes::from(raw)),
            Err(e) => {
                self.record_codec_error(key, "encode", Error::from(e));
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Option<T> {
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                self.record_codec_error(key, "decode", Error::from(e));
                None
            }
        }
    }

    fn record_codec_error(&self, key: &str, direction: &'static str, error: Error) {
        self.stats.record_error();
        warn!(key, direction, error = %error, "cache payload rejected");
    }
}

/// Outcome of a memory-tier read
enum MemoryLookup<T> {
    Found(T),
    /// Present, but not decodable as the requested type; the entry stays
    /// and the remote tier is not consulted
    Undecodable,
    Absent,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("backend", &self.backend)
            .field("memory_entries", &self.memory_len())
            .field("connection_state", &self.connection_state())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::remote::InMemoryRemoteStore;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    fn ann() -> User {
        User {
            name: "Ann".to_string(),
        }
    }

    async fn memory_cache(clock: Arc<ManualClock>) -> CacheManager {
        CacheManager::with_parts(BackendConfig::memory_only(), None, clock)
            .await
            .unwrap()
    }

    async fn hybrid_cache(
        clock: Arc<ManualClock>,
        store: Arc<InMemoryRemoteStore>,
    ) -> CacheManager {
        CacheManager::with_parts(BackendConfig::default(), Some(store), clock)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_get_and_expire() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = memory_cache(clock.clone()).await;

        cache.set("user:42", &ann(), 5).await;
        assert_eq!(cache.get::<User>("user:42").await, Some(ann()));

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.get::<User>("user:42").await, None);
        assert_eq!(cache.memory_len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_default() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = memory_cache(clock.clone()).await;

        cache.set("k", &1u32, 0).await;
        clock.advance(Duration::from_secs(299));
        assert_eq!(cache.get::<u32>("k").await, Some(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_counted_not_raised() {
        let cache = memory_cache(Arc::new(ManualClock::new(0))).await;
        cache.set("k", "text", 60).await;

        assert_eq!(cache.get::<u64>("k").await, None);
        let stats = cache.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.misses, 1);

        // The stored entry is still valid for the type it was written as
        assert!(cache.exists("k").await);
        assert_eq!(cache.get::<String>("k").await, Some("text".to_string()));
    }

    #[tokio::test]
    async fn test_type_mismatch_in_hybrid_counts_one_error() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock, store.clone()).await;
        cache.set("k", "text", 60).await;
        let commands = store.commands();

        assert_eq!(cache.get::<u64>("k").await, None);
        assert_eq!(cache.mget::<u64, _>(&["k"]).await, vec![None]);
        assert_eq!(cache.stats().errors, 2);
        assert_eq!(store.commands(), commands);
        assert_eq!(cache.memory_len(), 1);
    }

    #[tokio::test]
    async fn test_unserializable_value_is_skipped() {
        let cache = memory_cache(Arc::new(ManualClock::new(0))).await;
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        cache.set("bad", &bad, 60).await;
        assert!(!cache.exists("bad").await);
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_hybrid_writes_through_and_writes_back() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock.clone(), store.clone()).await;
        assert_eq!(cache.backend_type(), BackendType::Hybrid);

        cache.set("user:42", &ann(), 60).await;
        assert!(store.peek("tiercache:user:42").is_some());

        // Seeded remotely only: first read comes from remote and lands in memory
        store.insert_raw(
            "tiercache:user:7",
            Bytes::from_static(br#"{"name":"Bo"}"#),
            Duration::from_secs(60),
        );
        let before = cache.memory_len();
        let user: Option<User> = cache.get("user:7").await;
        assert_eq!(user.map(|u| u.name), Some("Bo".to_string()));
        assert_eq!(cache.memory_len(), before + 1);

        let commands = store.commands();
        assert!(cache.get::<User>("user:7").await.is_some());
        assert_eq!(store.commands(), commands);
    }

    #[tokio::test]
    async fn test_miss_in_both_tiers_counts_once() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock, store).await;

        assert_eq!(cache.get::<u32>("nope").await, None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.requests, 1);
    }

    #[tokio::test]
    async fn test_auto_with_unreachable_remote_is_memory_only() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        store.set_unreachable(true);
        let cache = hybrid_cache(clock, store.clone()).await;

        assert_eq!(cache.backend_type(), BackendType::Memory);
        assert_eq!(cache.connection_state(), ConnectionState::Disabled);
        assert!(cache.remote().is_none());
        assert_eq!(cache.stats().backend_status, BackendStatus::Connected);

        cache.set("k", &1u8, 60).await;
        assert_eq!(cache.get::<u8>("k").await, Some(1));
        assert_eq!(store.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_outage_never_surfaces() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock, store.clone()).await;

        store.set_unreachable(true);
        cache.set("k", &"v", 60).await;
        assert_eq!(cache.get::<String>("k").await, Some("v".to_string()));
        assert_eq!(cache.get::<String>("other").await, None);
        cache.delete("k").await;

        let stats = cache.stats();
        assert!(stats.errors >= 1);
        assert_eq!(stats.backend_status, BackendStatus::Degraded);
        assert_eq!(cache.backend_type(), BackendType::Hybrid);
    }

    #[tokio::test]
    async fn test_remote_only_without_memory() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let config = BackendConfig {
            preferred_backend: PreferredBackend::Remote,
            ..BackendConfig::default()
        };
        let cache = CacheManager::with_parts(config, Some(store.clone()), clock)
            .await
            .unwrap();

        assert_eq!(cache.backend_type(), BackendType::Remote);
        assert!(cache.memory().is_none());

        cache.set("k", &5i32, 60).await;
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(cache.get::<i32>("k").await, Some(5));
        assert!(cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_auto_without_memory_degrades_to_remote() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        store.set_unreachable(true);
        let config = BackendConfig {
            enable_memory_cache: false,
            ..BackendConfig::default()
        };
        let cache = CacheManager::with_parts(config, Some(store), clock)
            .await
            .unwrap();

        assert_eq!(cache.backend_type(), BackendType::Remote);
        assert_eq!(cache.stats().backend_status, BackendStatus::Degraded);
        assert_eq!(cache.get::<u8>("k").await, None);
        cache.destroy().await;
    }

    #[tokio::test]
    async fn test_batch_roundtrip() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock, store.clone()).await;

        cache
            .mset(&[CacheItem::new("a", 1), CacheItem::new("b", 2).with_ttl(30)])
            .await;
        assert_eq!(cache.mget::<i32, _>(&["a", "b", "c"]).await, vec![Some(1), Some(2), None]);

        // Memory misses are served from the remote batch
        cache.memory().unwrap().clear();
        assert_eq!(cache.mget::<i32, _>(&["b", "a"]).await, vec![Some(2), Some(1)]);
        assert_eq!(cache.memory_len(), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_exists_falls_through_to_remote() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock, store.clone()).await;

        store.insert_raw("tiercache:remote-only", Bytes::from_static(b"1"), Duration::from_secs(60));
        assert!(cache.exists("remote-only").await);
        assert!(!cache.exists("missing").await);
    }

    #[tokio::test]
    async fn test_delete_and_clear_reach_every_tier() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock, store.clone()).await;

        cache.set("a", &1, 60).await;
        cache.set("b", &2, 60).await;
        cache.delete("a").await;
        assert!(store.peek("tiercache:a").is_none());
        assert!(!cache.exists("a").await);

        store.insert_raw("elsewhere:b", Bytes::from_static(b"2"), Duration::from_secs(60));
        cache.clear().await;
        assert_eq!(cache.memory_len(), 0);
        assert!(store.peek("tiercache:b").is_none());
        assert!(store.peek("elsewhere:b").is_some());
    }

    #[tokio::test]
    async fn test_get_or_insert_with_computes_once() {
        let cache = memory_cache(Arc::new(ManualClock::new(0))).await;
        let counter = std::sync::atomic::AtomicU32::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let value = cache
                .get_or_insert_with("answer", 60, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    42u32
                })
                .await;
            assert_eq!(value, 42);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let failed: std::result::Result<u32, &str> = cache
            .get_or_try_insert_with("broken", 60, || async { Err("source down") })
            .await;
        assert_eq!(failed, Err("source down"));
        assert!(!cache.exists("broken").await);
    }

    /// Store whose reads are slow and keep answering after `close`, the way
    /// a cloned connection handle does
    struct LingeringStore {
        inner: InMemoryRemoteStore,
        read_delay: Duration,
    }

    #[async_trait::async_trait]
    impl RemoteStore for LingeringStore {
        async fn connect(&self) -> Result<()> {
            self.inner.connect().await
        }
        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            tokio::time::sleep(self.read_delay).await;
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
            self.inner.set_ex(key, value, ttl_seconds).await
        }
        async fn del(&self, key: &str) -> Result<bool> {
            self.inner.del(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
            self.inner.mget(keys).await
        }
        async fn mset_ex(&self, entries: &[(String, Bytes, u64)]) -> Result<()> {
            self.inner.mset_ex(entries).await
        }
        async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
            self.inner.clear_prefix(prefix).await
        }
        async fn close(&self) {}
        fn name(&self) -> &'static str {
            "lingering"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_read_does_not_refill_destroyed_cache() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(LingeringStore {
            inner: InMemoryRemoteStore::with_clock(clock.clone()),
            read_delay: Duration::from_millis(500),
        });
        store
            .inner
            .insert_raw("tiercache:k", Bytes::from_static(b"1"), Duration::from_secs(60));
        let cache = Arc::new(
            CacheManager::with_parts(BackendConfig::default(), Some(store), clock)
                .await
                .unwrap(),
        );
        assert_eq!(cache.backend_type(), BackendType::Hybrid);

        let reader = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get::<i32>("k").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.destroy().await;
        assert_eq!(cache.memory_len(), 0);

        reader.await.unwrap();
        assert_eq!(cache.memory_len(), 0);
        assert!(cache.memory().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryRemoteStore::with_clock(clock.clone()));
        let cache = hybrid_cache(clock, store.clone()).await;
        cache.set("k", &1, 60).await;

        let memory = Arc::clone(cache.memory().unwrap());
        assert!(memory.sweeper_running());

        cache.destroy().await;
        cache.destroy().await;

        assert!(cache.is_destroyed());
        assert!(!memory.sweeper_running());
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(cache.connection_state(), ConnectionState::Disabled);
        assert_eq!(cache.get::<i32>("k").await, None);
        assert_eq!(cache.mget::<i32, _>(&["k"]).await, vec![None]);
    }

    #[tokio::test]
    async fn test_invalid_configuration_rejected() {
        let config = BackendConfig {
            max_entries: 0,
            ..BackendConfig::default()
        };
        assert_matches!(CacheManager::new(config).await, Err(Error::Configuration(_)));

        let config = BackendConfig {
            preferred_backend: PreferredBackend::Remote,
            ..BackendConfig::default()
        };
        assert_matches!(CacheManager::new(config).await, Err(Error::Configuration(_)));

        let config = BackendConfig {
            remote: Some(RemoteConfig::with_url("not a url")),
            ..BackendConfig::default()
        };
        assert_matches!(CacheManager::new(config).await, Err(Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_memory_preference_ignores_remote() {
        let config = BackendConfig {
            remote: Some(RemoteConfig::with_url("redis://127.0.0.1:1")),
            ..BackendConfig::memory_only()
        };
        let cache = CacheManager::new(config).await.unwrap();
        assert_eq!(cache.backend_type(), BackendType::Memory);
        assert!(cache.remote().is_none());
        cache.destroy().await;
    }
}
