//! Connection State Machine
//!
//! Pure transition logic for the remote tier connection. Holds no timers and
//! does no I/O, so every backoff decision is testable without sleeping.
//!
//! ```text
//!              enable                 handshake ok
//!  Disabled ─────────▶ Connecting ───────────────▶ Connected
//!     ▲                  │    ▲                        │
//!     │ max_attempts     │    │ delay elapsed          │ failure
//!     │ reached          ▼    │                        ▼
//!     └──────────────── ErrorBackoff ◀─────────────────┘
//! ```

use std::time::Duration;

use serde::Serialize;

use crate::cache::config::ReconnectConfig;

/// Remote connection health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not in use, or given up on for the rest of the process lifetime
    Disabled,
    /// Never connected yet
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Serving operations
    Connected,
    /// Waiting out a backoff delay before the next attempt
    ErrorBackoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disabled => write!(f, "disabled"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ErrorBackoff => write!(f, "error_backoff"),
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Cap for a single delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }
}

impl ReconnectPolicy {
    /// `base_delay * 2^attempt`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// What the caller should do after a failure was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Wait this long, then try to connect again
    Backoff(Duration),
    /// Too many consecutive failures; now `Disabled`
    GaveUp,
    /// Not in a state where failures count (already backing off or disabled)
    Ignored,
}

/// Connection state plus the consecutive-failure counter
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    consecutive_failures: u32,
    policy: ReconnectPolicy,
}

impl ConnectionStateMachine {
    /// Start in `Disconnected`
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            policy,
        }
    }

    /// Start in `Disabled`; only [`enable`](Self::enable) leaves it
    pub fn disabled(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disabled,
            consecutive_failures: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Claim the right to attempt a handshake. Only one caller wins while a
    /// handshake is in flight.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::ErrorBackoff => {
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Handshake succeeded
    pub fn on_connected(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.consecutive_failures = 0;
        }
    }

    /// A handshake or an operation failed for a connection-level reason
    pub fn on_failure(&mut self) -> FailureOutcome {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.policy.max_attempts {
                    self.state = ConnectionState::Disabled;
                    FailureOutcome::GaveUp
                } else {
                    self.state = ConnectionState::ErrorBackoff;
                    FailureOutcome::Backoff(
                        self.policy.delay_for(self.consecutive_failures - 1),
                    )
                }
            }
            _ => FailureOutcome::Ignored,
        }
    }

    /// Explicit external re-enable out of `Disabled`; resets the counter and
    /// moves straight to `Connecting`. Returns whether the transition happened.
    pub fn enable(&mut self) -> bool {
        if self.state == ConnectionState::Disabled {
            self.state = ConnectionState::Connecting;
            self.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    /// Shutdown: force `Disabled`
    pub fn disable(&mut self) {
        self.state = ConnectionState::Disabled;
    }
}

// =============================================================================
// Tests
// =============================================================================
