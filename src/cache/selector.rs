//! Backend Selector
//!
//! Decides which tiers are active from the configured preference and what
//! the startup probe found out about the remote tier.

use serde::Serialize;

use super::config::PreferredBackend;
use crate::error::{Error, Result};

/// Active backend set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Memory tier only
    Memory,
    /// Remote tier only
    Remote,
    /// Memory in front of remote
    Hybrid,
}

impl BackendType {
    /// Whether reads and writes go to the memory tier
    pub fn uses_memory(&self) -> bool {
        matches!(self, BackendType::Memory | BackendType::Hybrid)
    }

    /// Whether reads and writes go to the remote tier
    pub fn uses_remote(&self) -> bool {
        matches!(self, BackendType::Remote | BackendType::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Memory => "memory",
            BackendType::Remote => "remote",
            BackendType::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is known about the remote tier at selection time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAvailability {
    /// No endpoint configured
    NotConfigured,
    /// Configured, but the startup probe failed
    Unreachable,
    /// Configured and answered the startup probe
    Reachable,
}

/// Selection policy
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendSelector;

impl BackendSelector {
    /// Pick the active backend set.
    ///
    /// An explicit preference is used verbatim. `auto` goes hybrid only when
    /// the remote tier is reachable; otherwise it stays on memory. With the
    /// memory tier disabled, `auto` falls back to remote-only (degraded if
    /// unreachable) as long as an endpoint exists.
    pub fn select(
        preferred: PreferredBackend,
        memory_enabled: bool,
        remote: RemoteAvailability,
    ) -> Result<BackendType> {
        let remote_configured = remote != RemoteAvailability::NotConfigured;

        match preferred {
            PreferredBackend::Memory => {
                if !memory_enabled {
                    return Err(Error::Configuration(
                        "memory backend requested with the memory cache disabled".into(),
                    ));
                }
                Ok(BackendType::Memory)
            }
            PreferredBackend::Remote => {
                if !remote_configured {
                    return Err(Error::Configuration(
                        "remote backend requested without a remote endpoint".into(),
                    ));
                }
                Ok(BackendType::Remote)
            }
            PreferredBackend::Auto => match (memory_enabled, remote) {
                (true, RemoteAvailability::Reachable) => Ok(BackendType::Hybrid),
                (true, _) => Ok(BackendType::Memory),
                (false, RemoteAvailability::NotConfigured) => Err(Error::Configuration(
                    "no cache tier available: memory cache disabled and no remote endpoint"
                        .into(),
                )),
                (false, _) => Ok(BackendType::Remote),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
