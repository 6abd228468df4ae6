//! Health Checks
//!
//! Liveness and readiness for the cache daemon. Readiness is derived from
//! the cache's own stats: a degraded remote tier still leaves the cache
//! operational, since every caller tolerates misses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::{BackendStatus, CacheStats};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Every tier is serving
    Healthy,
    /// Serving, but a tier is failing or gave up
    Degraded,
    /// Not serving
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Message
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }

    /// Check derived from a stats snapshot
    pub fn from_stats(stats: &CacheStats) -> Self {
        match stats.backend_status {
            BackendStatus::Connected => Self::healthy("cache"),
            BackendStatus::Degraded => Self::degraded(
                "cache",
                format!("{} backend: remote tier reconnecting", stats.backend_type),
            ),
            BackendStatus::Disabled => Self::degraded(
                "cache",
                format!("{} backend: remote tier disabled", stats.backend_type),
            ),
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status among the checks
    pub status: HealthStatus,
    /// Individual check results
    pub checks: Vec<HealthCheckResult>,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: crate::VERSION.to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Process health flags
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthCheck {
    /// Live, not yet ready
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Readiness report: the readiness flag plus the cache check
    pub fn readiness(&self, stats: &CacheStats) -> HealthResponse {
        let readiness = if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "Service not ready")
        };

        HealthResponse::new(
            vec![readiness, HealthCheckResult::from_stats(stats)],
            self.uptime(),
        )
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BackendType, StatsCollector, TierFigures};

    fn stats(backend: BackendType, status: BackendStatus) -> CacheStats {
        StatsCollector::new().snapshot(backend, status, TierFigures::default())
    }

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Degraded.is_healthy());
        assert!(!HealthStatus::Unhealthy.is_operational());
        assert_eq!(HealthStatus::Degraded.to_string(), "Degraded");
    }

    #[test]
    fn test_check_from_stats() {
        let check = HealthCheckResult::from_stats(&stats(BackendType::Memory, BackendStatus::Connected));
        assert_eq!(check.status, HealthStatus::Healthy);

        let check = HealthCheckResult::from_stats(&stats(BackendType::Hybrid, BackendStatus::Degraded));
        assert_eq!(check.status, HealthStatus::Degraded);
        assert!(check.message.unwrap().contains("hybrid"));

        let check = HealthCheckResult::from_stats(&stats(BackendType::Remote, BackendStatus::Disabled));
        assert_eq!(check.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_response_takes_worst_status() {
        let checks = vec![
            HealthCheckResult::healthy("a"),
            HealthCheckResult::degraded("b", "slow"),
        ];
        let response = HealthResponse::new(checks, Duration::from_secs(60));
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.uptime_seconds, 60);
        assert_eq!(response.version, crate::VERSION);
    }

    #[test]
    fn test_readiness_follows_flag() {
        let health = HealthCheck::new();
        let snapshot = stats(BackendType::Memory, BackendStatus::Connected);

        assert!(health.is_live());
        assert_eq!(health.readiness(&snapshot).status, HealthStatus::Unhealthy);

        health.set_ready(true);
        let response = health.readiness(&snapshot);
        assert_eq!(response.status, HealthStatus::Healthy);
        assert_eq!(response.checks.len(), 2);

        health.set_ready(false);
        health.set_live(false);
        assert!(!health.is_live());
        assert_eq!(health.readiness(&snapshot).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&HealthCheckResult::healthy("cache")).unwrap();
        assert!(json.contains("Healthy"));
        let back: HealthCheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, HealthStatus::Healthy);
    }
}
