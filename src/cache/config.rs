//! Cache Configuration
//!
//! Supplied once at process start and immutable afterwards. Can be built in
//! code, loaded from YAML, or assembled from CLI flags by the daemon.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{
    DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_EVICTION_FRACTION, DEFAULT_MAX_ENTRIES,
    DEFAULT_TTL_SECONDS,
};

/// Which backend set the operator asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredBackend {
    /// Memory only, plus the remote tier when it is configured and reachable
    #[default]
    Auto,
    /// Memory tier only
    Memory,
    /// Remote tier only
    Remote,
}

impl std::fmt::Display for PreferredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreferredBackend::Auto => write!(f, "auto"),
            PreferredBackend::Memory => write!(f, "memory"),
            PreferredBackend::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for PreferredBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PreferredBackend::Auto),
            "memory" => Ok(PreferredBackend::Memory),
            "remote" | "redis" => Ok(PreferredBackend::Remote),
            other => Err(Error::Configuration(format!(
                "unknown backend '{}', expected auto, memory or remote",
                other
            ))),
        }
    }
}

/// Remote tier endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Connection URL, credentials included (`redis://:pass@host:6379/0`)
    pub url: String,
    /// Prefix prepended to every key written to the remote store
    pub key_prefix: String,
    /// Deadline for establishing a connection
    pub connect_timeout_ms: u64,
    /// Deadline for a single command or pipeline
    pub command_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "tiercache:".to_string(),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 2_000,
        }
    }
}

impl RemoteConfig {
    /// Remote config pointing at `url` with default timeouts
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Reconnection backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive failures before the remote tier gives up for good
    pub max_attempts: u32,
    /// First backoff delay; doubles on every further failure
    pub base_delay_ms: u64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Requested backend set
    pub preferred_backend: PreferredBackend,
    /// TTL used when callers pass 0 and for remote write-back
    pub default_ttl_seconds: u64,
    /// Memory tier capacity in entries
    pub max_entries: usize,
    /// Period of the background expiry sweep
    pub cleanup_interval_ms: u64,
    /// Whether the memory tier participates at all
    pub enable_memory_cache: bool,
    /// Share of `max_entries` evicted per capacity pass, in (0, 1]
    pub eviction_fraction: f64,
    /// Remote endpoint, if any
    pub remote: Option<RemoteConfig>,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            preferred_backend: PreferredBackend::Auto,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            max_entries: DEFAULT_MAX_ENTRIES,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            enable_memory_cache: true,
            eviction_fraction: DEFAULT_EVICTION_FRACTION,
            remote: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Memory-only configuration
    pub fn memory_only() -> Self {
        Self {
            preferred_backend: PreferredBackend::Memory,
            ..Self::default()
        }
    }

    /// Load from a YAML file; omitted fields take their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse from a YAML document and validate
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: BackendConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Reject parameter combinations that cannot produce a working cache
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_seconds == 0 {
            return Err(Error::Configuration(
                "default_ttl_seconds must be greater than 0".into(),
            ));
        }
        if self.max_entries == 0 {
            return Err(Error::Configuration(
                "max_entries must be greater than 0".into(),
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(Error::Configuration(
                "cleanup_interval_ms must be greater than 0".into(),
            ));
        }
        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "eviction_fraction must be in (0, 1], got {}",
                self.eviction_fraction
            )));
        }

        let reconnect = &self.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(Error::Configuration(
                "reconnect.max_attempts must be greater than 0".into(),
            ));
        }
        if reconnect.base_delay_ms == 0 {
            return Err(Error::Configuration(
                "reconnect.base_delay_ms must be greater than 0".into(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(Error::Configuration(format!(
                "reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }

        if let Some(remote) = &self.remote {
            if remote.url.trim().is_empty() {
                return Err(Error::Configuration("remote.url must not be empty".into()));
            }
            if remote.command_timeout_ms == 0 || remote.connect_timeout_ms == 0 {
                return Err(Error::Configuration(
                    "remote timeouts must be greater than 0".into(),
                ));
            }
        }

        match self.preferred_backend {
            PreferredBackend::Remote if self.remote.is_none() => Err(Error::Configuration(
                "preferred_backend is remote but no remote endpoint is configured".into(),
            )),
            PreferredBackend::Memory if !self.enable_memory_cache => Err(Error::Configuration(
                "preferred_backend is memory but the memory cache is disabled".into(),
            )),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
