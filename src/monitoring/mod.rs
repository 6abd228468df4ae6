//! Observability surface for the cache daemon
//!
//! Health checks derived from cache stats and Prometheus exposition of the
//! same numbers.

mod exporter;
mod health;

pub use exporter::CacheMetricsExporter;
pub use health::{HealthCheck, HealthCheckResult, HealthResponse, HealthStatus};
