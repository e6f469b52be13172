//! Redis storage backend for TokenVault.
//!
//! Maps the [`KvStore`] contract onto native Redis commands:
//!
//! | Operation            | Command                         |
//! |----------------------|---------------------------------|
//! | `get` / `set`        | `GET` / `SET .. PX`             |
//! | `scan`               | `SCAN .. MATCH`                 |
//! | `incr` / `decr`      | `INCRBY`                        |
//! | set helpers          | `SADD` / `SREM` / `SMEMBERS`    |
//! | `lock_acquire`       | `SET .. NX PX`                  |
//! | `lock_release`       | compare-and-delete Lua script   |
//!
//! Values are stored as JSON strings, so integer counters written by
//! `INCRBY` read back as JSON numbers.
//!
//! # Example
//!
//! ```ignore
//! use tokenvault_redis::RedisKvStore;
//!
//! let store = RedisKvStore::connect("redis://127.0.0.1:6379").await?;
//! store.set("k", serde_json::json!(1), None).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tokenvault_storage::{KvStore, LockToken, StorageError, StorageResult};

/// Compare-and-delete so only the owner releases a lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const SCAN_BATCH: usize = 500;
const LOCK_POLL_START: Duration = Duration::from_millis(10);
const LOCK_POLL_MAX: Duration = Duration::from_millis(250);

/// Redis-backed [`KvStore`].
///
/// The connection manager reconnects transparently; each call works on a
/// cheap clone of it.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Wraps an existing connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connects to the server at `url`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = redis::Client::open(url).map_err(redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_error)?;
        tracing::info!(backend = "redis", "connected to key-value store");
        Ok(Self::new(conn))
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Maps a client error onto the shared storage error type.
fn redis_error(err: redis::RedisError) -> StorageError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
        StorageError::connection_error(err.to_string())
    } else {
        StorageError::backend(err.to_string())
    }
}

/// Converts a TTL to whole milliseconds, never below one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Interprets a `PTTL` reply. Negative replies mean missing or persistent.
fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

fn decode(key: &str, raw: Option<String>) -> StorageResult<Option<Value>> {
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| StorageError::serialization(format!("undecodable value at {key}: {e}")))
    })
    .transpose()
}

fn set_command(key: &str, encoded: String, ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(encoded);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(ttl_millis(ttl));
    }
    cmd
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| {
                if e.code() == Some("WRONGTYPE") {
                    StorageError::wrong_type(key, "value")
                } else {
                    redis_error(e)
                }
            })?;
        decode(key, raw)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let encoded = serde_json::to_string(&value)?;
        set_command(key, encoded, ttl)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(redis_error)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(redis_error)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(redis_error)?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(redis_error)?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(redis_error)?;
        Ok(pttl_to_duration(pttl))
    }

    async fn scan(&self, pattern: &str) -> StorageResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn())
            .await
            .map_err(redis_error)?;
        keys.iter()
            .zip(raw)
            .map(|(key, raw)| decode(key, raw))
            .collect()
    }

    async fn mset(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let encoded = serde_json::to_string(&value)?;
            pipe.add_command(set_command(&key, encoded, ttl)).ignore();
        }
        pipe.query_async::<()>(&mut self.conn())
            .await
            .map_err(redis_error)
    }

    async fn incr(&self, key: &str, delta: i64) -> StorageResult<i64> {
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| match e.code() {
                Some("WRONGTYPE") | Some("ERR") => StorageError::wrong_type(key, "integer"),
                _ => redis_error(e),
            })
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| set_error(key, e))?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| set_error(key, e))?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| set_error(key, e))?;
        members.sort();
        Ok(members)
    }

    async fn lock_acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait: Option<Duration>,
    ) -> StorageResult<Option<LockToken>> {
        let token = LockToken::generate();
        let deadline = wait.map(|wait| tokio::time::Instant::now() + wait);
        let mut conn = self.conn();
        let mut backoff = LOCK_POLL_START;

        loop {
            let reply: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(token.as_str())
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            if reply.is_some() {
                return Ok(Some(token));
            }

            // No server-side notification is assumed, so waiters poll with a capped backoff.
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(LOCK_POLL_MAX);
        }
    }

    async fn lock_release(&self, name: &str, token: &LockToken) -> StorageResult<bool> {
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(name)
            .arg(token.as_str())
            .invoke_async(&mut self.conn())
            .await
            .map_err(redis_error)?;
        Ok(removed == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn set_error(key: &str, err: redis::RedisError) -> StorageError {
    if err.code() == Some("WRONGTYPE") {
        StorageError::wrong_type(key, "set")
    } else {
        redis_error(err)
    }
}

// =============================================================================
// Tests
// =============================================================================
