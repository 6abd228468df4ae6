//! Cache Entry
//!
//! A serialized payload plus the bookkeeping the memory tier needs for TTL
//! expiry and approximate-LRU eviction. Access metadata is atomic so a hit
//! can be recorded under a shared read lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

/// Entry held by the memory tier
#[derive(Debug)]
pub struct CacheEntry {
    /// Key this entry is stored under
    key: String,
    /// Serialized payload
    value: Bytes,
    /// Creation timestamp (clock millis)
    created_at: u64,
    /// Time to live in seconds (always > 0)
    ttl_seconds: u64,
    /// Successful reads since creation
    access_count: AtomicU64,
    /// Last successful read, or creation time (clock millis)
    last_accessed_at: AtomicU64,
    /// Insertion order, breaks ties between equal access times
    sequence: u64,
}

impl CacheEntry {
    /// Create a new entry stamped at `now_millis`
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        ttl_seconds: u64,
        now_millis: u64,
        sequence: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: now_millis,
            ttl_seconds: ttl_seconds.max(1),
            access_count: AtomicU64::new(0),
            last_accessed_at: AtomicU64::new(now_millis),
            sequence,
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialized payload (cheap clone)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    #[inline]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_accessed_at(&self) -> u64 {
        self.last_accessed_at.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Record a successful read
    #[inline]
    pub fn record_access(&self, now_millis: u64) -> u64 {
        self.last_accessed_at
            .fetch_max(now_millis, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// An entry is live while `now - created_at < ttl`
    #[inline]
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.created_at) >= self.ttl_seconds.saturating_mul(1000)
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.value.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(ttl_seconds: u64, now: u64) -> CacheEntry {
        CacheEntry::new("user:42", Bytes::from_static(b"{\"name\":\"Ann\"}"), ttl_seconds, now, 0)
    }

    #[test]
    fn test_entry_creation() {
        let entry = make_entry(5, 1_000);
        assert_eq!(entry.key(), "user:42");
        assert_eq!(entry.created_at(), 1_000);
        assert_eq!(entry.last_accessed_at(), 1_000);
        assert_eq!(entry.access_count(), 0);
        assert_eq!(entry.ttl(), Duration::from_secs(5));
        assert_eq!(entry.size(), 14);
    }

    #[test]
    fn test_zero_ttl_is_clamped() {
        let entry = make_entry(0, 0);
        assert_eq!(entry.ttl_seconds(), 1);
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = make_entry(5, 1_000);
        assert!(!entry.is_expired_at(1_000));
        assert!(!entry.is_expired_at(5_999));
        assert!(entry.is_expired_at(6_000));
        assert!(entry.is_expired_at(60_000));
    }

    #[test]
    fn test_record_access() {
        let entry = make_entry(5, 1_000);
        assert_eq!(entry.record_access(1_500), 1);
        assert_eq!(entry.record_access(2_000), 2);
        assert_eq!(entry.access_count(), 2);
        assert_eq!(entry.last_accessed_at(), 2_000);

        // A stale timestamp never moves last access backwards
        entry.record_access(1_200);
        assert_eq!(entry.last_accessed_at(), 2_000);
    }
}
