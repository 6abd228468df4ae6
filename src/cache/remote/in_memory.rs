//! In-Memory Remote Store
//!
//! Process-local stand-in for the networked tier, used in tests and for
//! running the daemon without Redis. Honours TTLs against the injected clock
//! and supports fault injection so outage handling can be exercised.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use super::RemoteStore;
use crate::cache::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: u64,
}

/// In-memory remote store with fault injection.
/// Uses DashMap so concurrent callers do not serialize on one lock.
#[derive(Debug)]
pub struct InMemoryRemoteStore {
    data: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
    unreachable: AtomicBool,
    fail_next: AtomicU32,
    failing_keys: DashSet<String>,
    latency: Mutex<Option<Duration>>,
    connect_attempts: AtomicU64,
    commands: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryRemoteStore {
    /// Create a store on the wall clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose TTLs follow `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: DashMap::new(),
            clock,
            connected: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            failing_keys: DashSet::new(),
            latency: Mutex::new(None),
            connect_attempts: AtomicU64::new(0),
            commands: AtomicU64::new(0),
        }
    }

    /// Simulate a network partition: every call fails until cleared.
    /// Going unreachable also drops the current connection.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
        if unreachable {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Fail the next `n` calls with a connection error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every command touching `key` fail while leaving the connection
    /// up. Batches substitute a miss (or skip the write) for that key only.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.insert(key.to_string());
    }

    /// Undo every [`fail_key`](Self::fail_key)
    pub fn clear_failing_keys(&self) {
        self.failing_keys.clear();
    }

    /// Delay every call by `latency` (drives timeout handling)
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Handshake attempts seen so far
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Data commands served (connect/ping excluded)
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    /// Live keys currently stored
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a raw value, bypassing connection checks (test inspection)
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now_millis();
        self.data
            .get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| v.data.clone())
    }

    /// Write a raw value, bypassing connection checks (test seeding)
    pub fn insert_raw(&self, key: &str, data: Bytes, ttl: Duration) {
        let expires_at = self.clock.now_millis() + ttl.as_millis() as u64;
        self.data
            .insert(key.to_string(), StoredValue { data, expires_at });
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Connection("remote store unreachable".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Connection("injected failure".into()));
        }
        Ok(())
    }

    async fn command(&self) -> Result<()> {
        self.simulate_latency().await;
        self.check_reachable()?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Connection("not connected".into()));
        }
        self.commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if self.failing_keys.contains(key) {
            return Err(Error::Internal(format!("injected failure for key '{}'", key)));
        }
        Ok(())
    }

    fn live(&self, key: &str, now: u64) -> Option<Bytes> {
        let value = self.data.get(key)?;
        if value.expires_at > now {
            return Some(value.data.clone());
        }
        drop(value);
        self.data.remove_if(key, |_, v| v.expires_at <= now);
        None
    }

    fn store(&self, key: &str, data: Bytes, ttl_seconds: u64, now: u64) {
        let expires_at = now + ttl_seconds.max(1) * 1000;
        self.data
            .insert(key.to_string(), StoredValue { data, expires_at });
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_reachable()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.simulate_latency().await;
        self.check_reachable()?;
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connection("not connected".into()))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.command().await?;
        self.check_key(key)?;
        Ok(self.live(key, self.clock.now_millis()))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
        self.command().await?;
        self.check_key(key)?;
        self.store(key, value, ttl_seconds, self.clock.now_millis());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.command().await?;
        self.check_key(key)?;
        let now = self.clock.now_millis();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, v)| v.expires_at > now))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.command().await?;
        self.check_key(key)?;
        Ok(self.live(key, self.clock.now_millis()).is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.command().await?;
        let now = self.clock.now_millis();
        Ok(keys
            .iter()
            .map(|key| {
                if self.failing_keys.contains(key) {
                    None
                } else {
                    self.live(key, now)
                }
            })
            .collect())
    }

    async fn mset_ex(&self, entries: &[(String, Bytes, u64)]) -> Result<()> {
        self.command().await?;
        let now = self.clock.now_millis();
        for (key, value, ttl_seconds) in entries {
            if self.failing_keys.contains(key) {
                continue;
            }
            self.store(key, value.clone(), *ttl_seconds, now);
        }
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        self.command().await?;
        let before = self.data.len();
        self.data.retain(|key, _| !key.starts_with(prefix));
        Ok((before - self.data.len()) as u64)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

// =============================================================================
// Tests
// =============================================================================
