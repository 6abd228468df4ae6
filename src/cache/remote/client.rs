//! Remote Tier Client
//!
//! Best-effort wrapper around a [`RemoteStore`].
//!
//! # Design
//!
//! - Every operation is gated on the connection state: `Connected` proceeds,
//!   `Disconnected` triggers the lazy first handshake, anything else is an
//!   immediate miss/no-op
//! - Every store call runs under a deadline; a timeout is handled exactly
//!   like a network failure
//! - Failures are counted and logged here and never returned. Any failed
//!   handshake moves the state machine; during normal operation only
//!   connection-class failures do
//! - Reconnects are one-shot tasks chained through the state machine, each
//!   cancellable through a child of the tier's shutdown token

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::state::{ConnectionState, ConnectionStateMachine, FailureOutcome, ReconnectPolicy};
use super::RemoteStore;
use crate::cache::config::{ReconnectConfig, RemoteConfig};
use crate::error::{Error, Result};

/// Remote tier configuration
#[derive(Debug, Clone)]
pub struct RemoteTierConfig {
    /// Prepended to every key sent to the store
    pub key_prefix: String,
    /// Deadline for connect + ping
    pub connect_timeout: Duration,
    /// Deadline for a single command
    pub command_timeout: Duration,
    /// Reconnect backoff
    pub policy: ReconnectPolicy,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default(), &ReconnectConfig::default())
    }
}

impl RemoteTierConfig {
    /// Build from the endpoint and reconnect sections of a `BackendConfig`
    pub fn from_config(remote: &RemoteConfig, reconnect: &ReconnectConfig) -> Self {
        Self {
            key_prefix: remote.key_prefix.clone(),
            connect_timeout: remote.connect_timeout(),
            command_timeout: remote.command_timeout(),
            policy: ReconnectPolicy::from(reconnect),
        }
    }
}

/// Remote tier counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTierStats {
    /// Current connection state
    pub state: ConnectionState,
    /// Successful lookups that found a value
    pub hits: u64,
    /// Successful lookups that found nothing
    pub misses: u64,
    /// Failed operations (including timeouts and failed handshakes)
    pub errors: u64,
    /// Failures since the last successful handshake
    pub consecutive_failures: u32,
}

/// Best-effort client for the shared networked tier
pub struct RemoteTier {
    /// Underlying store
    store: Arc<dyn RemoteStore>,
    /// Configuration
    config: RemoteTierConfig,
    /// Connection state and failure counter
    machine: Mutex<ConnectionStateMachine>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    /// Every backoff delay scheduled so far, in order
    backoff_history: Mutex<Vec<Duration>>,
    /// Pending reconnect task
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Parent of every reconnect task's token
    shutdown: CancellationToken,
    closed: AtomicBool,
    /// Handle to ourselves for spawning reconnect tasks
    me: Weak<RemoteTier>,
}

impl RemoteTier {
    /// Create a tier in `Disconnected`; nothing touches the network until
    /// the first operation or an explicit [`connect`](Self::connect).
    pub fn new(store: Arc<dyn RemoteStore>, config: RemoteTierConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            machine: Mutex::new(ConnectionStateMachine::new(config.policy)),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            backoff_history: Mutex::new(Vec::new()),
            reconnect: Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.machine.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &RemoteTierConfig {
        &self.config
    }

    /// Name of the underlying store
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Every reconnect delay scheduled so far
    pub fn backoff_history(&self) -> Vec<Duration> {
        self.backoff_history.lock().clone()
    }

    pub fn stats(&self) -> RemoteTierStats {
        let machine = self.machine.lock();
        RemoteTierStats {
            state: machine.state(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            consecutive_failures: machine.consecutive_failures(),
        }
    }

    /// Attempt the handshake now if the state allows one.
    /// Returns whether the tier ends up connected.
    #[instrument(skip(self), fields(store = self.store.name()))]
    pub async fn connect(&self) -> bool {
        let claimed = self.machine.lock().begin_connect();
        if !claimed {
            return self.is_connected();
        }
        self.handshake().await
    }

    /// Explicit re-enable out of `Disabled`; resets the failure counter and
    /// connects immediately. No-op in any other state or after shutdown.
    pub async fn enable(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let enabled = self.machine.lock().enable();
        if !enabled {
            return self.is_connected();
        }
        info!(store = self.store.name(), "remote tier re-enabled");
        self.handshake().await
    }

    /// Fetch a value; any failure reads as a miss
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let full_key = self.full_key(key);
        let value = self.run("get", self.store.get(&full_key)).await.flatten();
        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Store a value; returns whether the write reached the store
    pub async fn set(&self, key: &str, value: Bytes, ttl_seconds: u64) -> bool {
        let full_key = self.full_key(key);
        self.run("set", self.store.set_ex(&full_key, value, ttl_seconds))
            .await
            .is_some()
    }

    /// Delete a key; returns whether it existed
    pub async fn delete(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        self.run("delete", self.store.del(&full_key))
            .await
            .unwrap_or(false)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        self.run("exists", self.store.exists(&full_key))
            .await
            .unwrap_or(false)
    }

    /// Fetch many values in one round trip. The result always has one slot
    /// per key; a failed batch is all misses.
    pub async fn mget(&self, keys: &[String]) -> Vec<Option<Bytes>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let mut values = self
            .run("mget", self.store.mget(&full_keys))
            .await
            .unwrap_or_default();
        values.resize(keys.len(), None);

        let found = values.iter().filter(|v| v.is_some()).count() as u64;
        self.hits.fetch_add(found, Ordering::Relaxed);
        self.misses
            .fetch_add(keys.len() as u64 - found, Ordering::Relaxed);
        values
    }

    /// Store many values in one pipelined round trip; returns how many
    /// entries were sent successfully (all or none)
    pub async fn mset(&self, entries: &[(String, Bytes, u64)]) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let prefixed: Vec<(String, Bytes, u64)> = entries
            .iter()
            .map(|(key, value, ttl)| (self.full_key(key), value.clone(), *ttl))
            .collect();
        match self.run("mset", self.store.mset_ex(&prefixed)).await {
            Some(()) => entries.len(),
            None => 0,
        }
    }

    /// Remove every key in this tier's namespace
    pub async fn clear(&self) -> u64 {
        let removed = self
            .run("clear", self.store.clear_prefix(&self.config.key_prefix))
            .await
            .unwrap_or(0);
        debug!(removed, prefix = %self.config.key_prefix, "remote tier cleared");
        removed
    }

    /// Cancel any pending reconnect, wait for it, disable the state machine
    /// and release the connection. Idempotent.
    #[instrument(skip(self), fields(store = self.store.name()))]
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        let pending = self.reconnect.lock().take();
        if let Some(task) = pending {
            let _ = task.await;
        }

        self.machine.lock().disable();
        self.store.close().await;
        info!("remote tier shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run one store call under the state gate and the command deadline
    async fn run<T, F>(&self, operation: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.ensure_connected().await {
            return None;
        }
        match with_deadline(operation, self.config.command_timeout, call).await {
            Ok(value) => Some(value),
            Err(e) => {
                self.record_failure(operation, &e);
                None
            }
        }
    }

    async fn ensure_connected(&self) -> bool {
        match self.state() {
            ConnectionState::Connected => true,
            ConnectionState::Disconnected => self.connect().await,
            _ => false,
        }
    }

    /// Connect + ping. Caller must have moved the machine to `Connecting`.
    async fn handshake(&self) -> bool {
        let store = &self.store;
        let result = with_deadline("connect", self.config.connect_timeout, async {
            store.connect().await?;
            store.ping().await
        })
        .await;

        match result {
            Ok(()) => {
                self.machine.lock().on_connected();
                let connected = self.is_connected();
                if connected {
                    info!(store = self.store.name(), "remote tier connected");
                }
                connected
            }
            Err(e) => {
                self.count_failure("connect", &e);
                self.on_connection_failure();
                false
            }
        }
    }

    /// Operation failure while connected. Only connection-class errors move
    /// the state machine; key-level errors leave the connection alone.
    fn record_failure(&self, operation: &'static str, error: &Error) {
        self.count_failure(operation, error);
        if error.is_connection() {
            self.on_connection_failure();
        }
    }

    fn count_failure(&self, operation: &'static str, error: &Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            operation,
            kind = error.kind(),
            error = %error,
            "remote tier operation failed"
        );
    }

    fn on_connection_failure(&self) {
        let (outcome, failures) = {
            let mut machine = self.machine.lock();
            let outcome = machine.on_failure();
            (outcome, machine.consecutive_failures())
        };

        match outcome {
            FailureOutcome::Backoff(delay) => self.schedule_reconnect(delay),
            FailureOutcome::GaveUp => warn!(
                failures,
                store = self.store.name(),
                "remote tier disabled after repeated failures, continuing in degraded mode"
            ),
            FailureOutcome::Ignored => {}
        }
    }

    fn schedule_reconnect(&self, delay: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }

        self.backoff_history.lock().push(delay);
        debug!(delay_ms = delay.as_millis() as u64, "remote tier reconnect scheduled");

        let token = self.shutdown.child_token();
        let tier = self.me.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(tier) = tier.upgrade() else { return };
            if !tier.machine.lock().begin_connect() {
                return;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tier.handshake() => {}
            }
        });

        // The previous handle belongs to the task that is scheduling us, or to
        // one that already finished
        *self.reconnect.lock() = Some(task);
    }
}

impl std::fmt::Debug for RemoteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTier")
            .field("store", &self.store.name())
            .field("key_prefix", &self.config.key_prefix)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for RemoteTier {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn with_deadline<T, F>(operation: &str, after: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
