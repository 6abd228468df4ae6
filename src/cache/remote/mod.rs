//! Remote Tier
//!
//! A networked key-value store behind [`RemoteStore`], wrapped by
//! [`RemoteTier`] which adds the connection state machine, per-call
//! timeouts, reconnect backoff and best-effort error swallowing.
//!
//! Payloads cross this boundary as bytes; encoding happens in the facade.

mod client;
mod in_memory;
mod redis_store;
mod state;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use client::{RemoteTier, RemoteTierConfig, RemoteTierStats};
pub use in_memory::InMemoryRemoteStore;
pub use redis_store::RedisStore;
pub use state::{ConnectionState, ConnectionStateMachine, FailureOutcome, ReconnectPolicy};

/// Networked key-value store used as the shared tier.
///
/// Keys passed in are already namespaced. Implementations return errors
/// freely; [`RemoteTier`] is what turns them into misses.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<()>;

    /// Round-trip health probe
    async fn ping(&self) -> Result<()>;

    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a value that expires after `ttl_seconds`
    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()>;

    /// Delete a key; returns whether it existed
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch many values in one round trip, positionally aligned with `keys`
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    /// Store many values in one pipelined round trip
    async fn mset_ex(&self, entries: &[(String, Bytes, u64)]) -> Result<()>;

    /// Delete every key under `prefix`; returns how many were removed
    async fn clear_prefix(&self, prefix: &str) -> Result<u64>;

    /// Release the connection handle
    async fn close(&self);

    /// Backend name for logs
    fn name(&self) -> &'static str;
}
