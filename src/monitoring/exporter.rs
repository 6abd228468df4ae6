//! Prometheus Exporter
//!
//! Mirrors [`CacheStats`] snapshots into a private Prometheus registry and
//! renders them in the text exposition format.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::{BackendStatus, CacheStats};
use crate::error::{Error, Result};

const NAMESPACE: &str = "tiercache";

const STATUSES: [BackendStatus; 3] = [
    BackendStatus::Connected,
    BackendStatus::Degraded,
    BackendStatus::Disabled,
];

/// Cache metrics registered under the `tiercache_` namespace
pub struct CacheMetricsExporter {
    registry: Registry,
    requests: IntCounter,
    hits: IntCounter,
    misses: IntCounter,
    errors: IntCounter,
    evictions: IntCounter,
    expirations: IntCounter,
    hit_rate: Gauge,
    memory_entries: IntGauge,
    avg_latency_micros: Gauge,
    backend_status: IntGaugeVec,
}

impl CacheMetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = counter(&registry, "requests_total", "Cache lookups served")?;
        let hits = counter(&registry, "hits_total", "Lookups answered by a tier")?;
        let misses = counter(&registry, "misses_total", "Lookups missed by every tier")?;
        let errors = counter(&registry, "errors_total", "Swallowed tier failures")?;
        let evictions = counter(&registry, "evictions_total", "Memory tier capacity evictions")?;
        let expirations = counter(&registry, "expirations_total", "Memory tier TTL expirations")?;

        let hit_rate = Gauge::with_opts(Opts::new("hit_rate", "hits / requests").namespace(NAMESPACE))?;
        registry.register(Box::new(hit_rate.clone()))?;

        let memory_entries = IntGauge::with_opts(
            Opts::new("memory_entries", "Entries held by the memory tier").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(memory_entries.clone()))?;

        let avg_latency_micros = Gauge::with_opts(
            Opts::new("avg_latency_micros", "Mean lookup latency in microseconds")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(avg_latency_micros.clone()))?;

        let backend_status = IntGaugeVec::new(
            Opts::new("backend_status", "1 for the current backend status").namespace(NAMESPACE),
            &["status"],
        )?;
        registry.register(Box::new(backend_status.clone()))?;

        Ok(Self {
            registry,
            requests,
            hits,
            misses,
            errors,
            evictions,
            expirations,
            hit_rate,
            memory_entries,
            avg_latency_micros,
            backend_status,
        })
    }

    /// Bring every metric up to date with `stats`
    pub fn observe(&self, stats: &CacheStats) {
        advance(&self.requests, stats.requests);
        advance(&self.hits, stats.hits);
        advance(&self.misses, stats.misses);
        advance(&self.errors, stats.errors);
        advance(&self.evictions, stats.evictions);
        advance(&self.expirations, stats.expirations);

        self.hit_rate.set(stats.hit_rate);
        self.memory_entries.set(stats.memory_entries as i64);
        self.avg_latency_micros.set(stats.avg_latency_micros);

        for status in STATUSES {
            let value = i64::from(status == stats.backend_status);
            self.backend_status
                .with_label_values(&[&status.to_string()])
                .set(value);
        }
    }

    /// Text exposition of the registry
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics output is not UTF-8: {}", e)))
    }

    /// Content type for [`encode`](Self::encode) output
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Counters only move forward; a smaller observation is ignored
fn advance(counter: &IntCounter, observed: u64) {
    let current = counter.get();
    if observed > current {
        counter.inc_by(observed - current);
    }
}

// =============================================================================
// Tests
// =============================================================================
