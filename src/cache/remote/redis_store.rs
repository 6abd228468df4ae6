//! Redis Remote Store
//!
//! [`RemoteStore`] over the `redis` crate's `ConnectionManager`. Batch writes
//! go out as one pipeline of `SET .. EX`, batch reads as one `MGET`, and
//! `clear_prefix` walks the keyspace with `SCAN` rather than `KEYS`.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::RemoteStore;
use crate::error::{Error, Result};

/// Keys fetched per `SCAN` page
const SCAN_PAGE_SIZE: usize = 500;

/// Redis-backed remote store
pub struct RedisStore {
    /// Client (holds the parsed connection info)
    client: redis::Client,
    /// Live connection, once established
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Parse `url` without connecting
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid redis url '{}': {}", url, e)))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("redis connection not established".into()))
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr.to_string())
            .field("connected", &self.conn.lock().is_some())
            .finish()
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn connect(&self) -> Result<()> {
        let manager = ConnectionManager::new(self.client.clone()).await?;
        *self.conn.lock() = Some(manager);
        info!(addr = %self.client.get_connection_info().addr, "connected to redis");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection()?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection()?;
        conn.set_ex::<_, _, ()>(key, value.as_ref(), ttl_seconds.max(1))
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn mset_ex(&self, entries: &[(String, Bytes, u64)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        for (key, value, ttl_seconds) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value.as_ref())
                .arg("EX")
                .arg((*ttl_seconds).max(1))
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.connection()?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(prefix = %prefix, removed, "redis prefix cleared");
        Ok(removed)
    }

    async fn close(&self) {
        if self.conn.lock().take().is_some() {
            debug!("redis connection released");
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
