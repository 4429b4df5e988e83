//! Shared counter store backing rate-limit admission state.
//!
//! Two implementations of the same trait: an in-process map for single
//! instances and tests, and a Redis-backed store shared by all gateway
//! replicas. The Redis variant uses read-modify-write on small JSON entries;
//! increments are therefore not linearizable across replicas, which the
//! admission layer tolerates (over-admission under contention, bounded by
//! the window logic itself).

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-key admission counter with window bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterEntry {
    /// Requests observed since the window started.
    pub count: u64,
    /// When the first request of the current window arrived (epoch ms).
    pub first_request_at: u64,
    /// When the most recent request arrived (epoch ms).
    pub last_request_at: u64,
}

/// Key/value counter abstraction shared by all gateway instances.
///
/// `ttl` is a retention hint: entries untouched for longer than it may be
/// dropped by the store. Window semantics live in the rate limiter, which
/// compares `first_request_at` itself.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments the counter for `key`, creating it on first use.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<CounterEntry>;

    /// Decrements the counter for `key`, floored at zero. Missing keys are a no-op.
    async fn decrement(&self, key: &str) -> Result<()>;

    /// Returns the current entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>>;

    /// Removes the entry for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Marks `key` as blocked for `duration`.
    async fn block(&self, key: &str, duration: Duration) -> Result<()>;

    /// Remaining block time for `key`, if it is currently blocked.
    async fn is_blocked(&self, key: &str) -> Result<Option<Duration>>;

    /// Drops expired entries. Returns how many were removed.
    async fn sweep(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    counter: CounterEntry,
    expires_at: u64,
}

/// Process-local counter store.
///
/// Used as the fallback when no distributed store is configured, and by
/// tests. Expired entries are removed lazily by the periodic sweep.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    blocks: DashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counter entries (test/observability helper).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<CounterEntry> {
        let now = now_millis();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                counter: CounterEntry {
                    count: 0,
                    first_request_at: now,
                    last_request_at: now,
                },
                expires_at: now + ttl.as_millis() as u64,
            });
        entry.counter.count += 1;
        entry.counter.last_request_at = now;
        entry.expires_at = now + ttl.as_millis() as u64;
        Ok(entry.counter.clone())
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.counter.count = entry.counter.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CounterEntry>> {
        Ok(self.entries.get(key).map(|e| e.counter.clone()))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let until = now_millis() + duration.as_millis() as u64;
        self.blocks.insert(key.to_string(), until);
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<Option<Duration>> {
        let until = match self.blocks.get(key) {
            Some(entry) => *entry.value(),
            None => return Ok(None),
        };
        let now = now_millis();
        if until > now {
            Ok(Some(Duration::from_millis(until - now)))
        } else {
            self.blocks.remove(key);
            Ok(None)
        }
    }

    async fn sweep(&self) -> Result<usize> {
        let now = now_millis();
        let before = self.entries.len() + self.blocks.len();
        self.entries.retain(|_, e| e.expires_at > now);
        self.blocks.retain(|_, until| *until > now);
        let removed = before - (self.entries.len() + self.blocks.len());
        if removed > 0 {
            debug!(removed, "swept expired counter entries");
        }
        Ok(removed)
    }
}

/// Redis-backed counter store shared across gateway instances.
///
/// Entries are JSON blobs with a TTL; blocks are bare keys whose TTL is the
/// block duration. Expiry is handled by Redis, so `sweep` is a no-op.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    /// Creates a store from a Redis URL (e.g. `redis://127.0.0.1:6379`).
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::Config(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            prefix: "gw:".to_string(),
        })
    }

    /// Overrides the key prefix used to namespace gateway state.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}counter:{}", self.prefix, key)
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}block:{}", self.prefix, key)
    }
}

fn store_err(e: redis::RedisError) -> GatewayError {
    GatewayError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<CounterEntry> {
        let mut conn = self.conn().await?;
        let redis_key = self.counter_key(key);
        let now = now_millis();

        let existing: Option<String> = conn.get(&redis_key).await.map_err(store_err)?;
        let mut entry = match existing.as_deref().map(serde_json::from_str) {
            Some(Ok(entry)) => entry,
            // Unparseable entries are replaced rather than surfaced.
            Some(Err(_)) | None => CounterEntry {
                count: 0,
                first_request_at: now,
                last_request_at: now,
            },
        };
        entry.count += 1;
        entry.last_request_at = now;

        let json = serde_json::to_string(&entry)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(&redis_key, json, ttl_secs)
            .await
            .map_err(store_err)?;
        Ok(entry)
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let redis_key = self.counter_key(key);
        let existing: Option<String> = conn.get(&redis_key).await.map_err(store_err)?;
        let Some(json) = existing else {
            return Ok(());
        };
        let Ok(mut entry) = serde_json::from_str::<CounterEntry>(&json) else {
            return Ok(());
        };
        entry.count = entry.count.saturating_sub(1);
        let remaining: i64 = conn.ttl(&redis_key).await.map_err(store_err)?;
        let ttl_secs = if remaining > 0 { remaining as u64 } else { 1 };
        let json = serde_json::to_string(&entry)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        let _: () = conn
            .set_ex(&redis_key, json, ttl_secs)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CounterEntry>> {
        let mut conn = self.conn().await?;
        let existing: Option<String> = conn
            .get(self.counter_key(key))
            .await
            .map_err(store_err)?;
        Ok(existing.and_then(|json| serde_json::from_str(&json).ok()))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.counter_key(key)).await.map_err(store_err)?;
        Ok(())
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(self.block_key(key), 1u8, duration.as_secs().max(1))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        let remaining: i64 = conn.ttl(self.block_key(key)).await.map_err(store_err)?;
        if remaining > 0 {
            Ok(Some(Duration::from_secs(remaining as u64)))
        } else {
            Ok(None)
        }
    }

    async fn sweep(&self) -> Result<usize> {
        // Redis expires entries itself.
        Ok(0)
    }
}
