//! Stats Collector
//!
//! Facade-level counters plus the [`CacheStats`] snapshot assembled from
//! them and from the tier-local counters on every `stats()` call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::remote::ConnectionState;
use super::selector::BackendType;

/// Health of the active backend set as reported in stats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Every active tier is serving
    Connected,
    /// Remote tier is active but currently failing or reconnecting
    Degraded,
    /// Remote tier gave up (or was shut down)
    Disabled,
}

impl BackendStatus {
    /// Status for a remote tier in `state`
    pub fn from_connection(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => BackendStatus::Connected,
            ConnectionState::Disabled => BackendStatus::Disabled,
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::ErrorBackoff => BackendStatus::Degraded,
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendStatus::Connected => write!(f, "connected"),
            BackendStatus::Degraded => write!(f, "degraded"),
            BackendStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Incremental mean: `avg' = avg + (sample - avg) / n`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningAverage {
    count: u64,
    mean: f64,
}

impl RunningAverage {
    pub fn record(&mut self, sample: f64) {
        self.count += 1;
        self.mean += (sample - self.mean) / self.count as f64;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Point-in-time aggregate cache statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups served (`hits + misses`)
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Swallowed failures across all tiers
    pub errors: u64,
    /// `hits / requests`, 0 when there were no requests
    pub hit_rate: f64,
    pub backend_type: BackendType,
    pub backend_status: BackendStatus,
    /// Memory tier capacity evictions
    pub evictions: u64,
    /// Memory tier entries dropped for age
    pub expirations: u64,
    /// Entries currently held by the memory tier
    pub memory_entries: usize,
    /// Mean lookup latency in microseconds
    pub avg_latency_micros: f64,
    /// When this snapshot was taken
    pub collected_at: DateTime<Utc>,
}

/// Tier-level figures folded into a snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct TierFigures {
    /// Errors counted inside the tiers
    pub errors: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub memory_entries: usize,
}

/// Facade hit/miss/error counters
#[derive(Debug, Default)]
pub struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    latency: Mutex<RunningAverage>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.lock().record(elapsed.as_secs_f64() * 1_000_000.0);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Build a snapshot. `requests` is derived from the loaded hit and miss
    /// values so the two always agree.
    pub fn snapshot(
        &self,
        backend_type: BackendType,
        backend_status: BackendStatus,
        tiers: TierFigures,
    ) -> CacheStats {
        let hits = self.hits();
        let misses = self.misses();
        let requests = hits + misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            hits as f64 / requests as f64
        };

        CacheStats {
            requests,
            hits,
            misses,
            errors: self.errors() + tiers.errors,
            hit_rate,
            backend_type,
            backend_status,
            evictions: tiers.evictions,
            expirations: tiers.expirations,
            memory_entries: tiers.memory_entries,
            avg_latency_micros: self.latency.lock().mean(),
            collected_at: Utc::now(),
        }
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
