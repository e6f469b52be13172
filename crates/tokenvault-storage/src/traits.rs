//! Key-value storage trait definitions.
//!
//! [`KvStore`] is the single persistence seam of the system. Every durable
//! piece of state (sessions, rotation records, credential metadata,
//! revocations, rate-limit counters, audit events) is stored through it, so
//! multiple process instances can share one backend.
//!
//! # Implementations
//!
//! - [`InMemoryKvStore`](crate::InMemoryKvStore) in this crate
//! - Redis (in `tokenvault-redis`)
//! - PostgreSQL (in `tokenvault-postgres`)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StorageResult;

/// Type alias for a shareable key-value store.
pub type DynKvStore = Arc<dyn KvStore>;

/// Ownership token returned by a successful lock acquisition.
///
/// Only the holder of the token can release the lock.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generates a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing token value.
    #[must_use]
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the token value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockToken").field(&"<redacted>").finish()
    }
}

/// Asynchronous key-value storage with expiry, counters, sets and locks.
///
/// Values are opaque JSON documents. Callers should use the typed helpers on
/// [`KvStoreExt`] rather than relying on any particular wire encoding.
///
/// # Concurrency
///
/// Implementations must tolerate concurrent callers on the same key.
/// `incr`/`decr`, set membership changes and lock acquisition must be atomic
/// at the provider level. Nothing beyond that is linearizable.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored at `key`, or `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key holds a set.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Stores `value` at `key`, replacing any previous value.
    ///
    /// A `ttl` of `None` stores the value without expiry.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()>;

    /// Deletes `key`. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Returns `true` if `key` holds a live value or set.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Sets the expiry of an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool>;

    /// Returns the remaining lifetime of `key`.
    ///
    /// Returns `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>>;

    /// Returns all live keys matching a glob `pattern` (`*` and `?` wildcards).
    ///
    /// This is a best-effort administrative query, not an indexed lookup.
    async fn scan(&self, pattern: &str) -> StorageResult<Vec<String>>;

    /// Fetches several keys at once, preserving the order of `keys`.
    async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<Value>>>;

    /// Stores several entries, all with the same optional `ttl`.
    async fn mset(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>)
    -> StorageResult<()>;

    /// Atomically adds `delta` to the integer at `key` and returns the new value.
    ///
    /// A missing or expired key counts as zero. The expiry of a live key is kept.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key holds a non-integer value or a set.
    async fn incr(&self, key: &str, delta: i64) -> StorageResult<i64>;

    /// Atomically subtracts `delta` from the integer at `key`.
    async fn decr(&self, key: &str, delta: i64) -> StorageResult<i64> {
        self.incr(key, -delta).await
    }

    /// Adds `member` to the set at `key`. Returns `true` if it was newly added.
    async fn add_to_set(&self, key: &str, member: &str) -> StorageResult<bool>;

    /// Removes `member` from the set at `key`. Returns `true` if it was present.
    async fn remove_from_set(&self, key: &str, member: &str) -> StorageResult<bool>;

    /// Returns every member of the set at `key` (empty if absent).
    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>>;

    /// Tries to take the lock `name` for `ttl`.
    ///
    /// With `wait` set, the call keeps trying until the deadline passes.
    /// Returns `None` if the lock could not be taken in time.
    async fn lock_acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait: Option<Duration>,
    ) -> StorageResult<Option<LockToken>>;

    /// Releases the lock `name` if it is still held by `token`.
    ///
    /// Returns `false` if the lock expired or belongs to someone else.
    async fn lock_release(&self, name: &str, token: &LockToken) -> StorageResult<bool>;

    /// Removes expired entries eagerly. Returns the number removed.
    ///
    /// Providers with native expiry can keep the default no-op.
    async fn purge_expired(&self) -> StorageResult<u64> {
        Ok(0)
    }

    /// Short provider name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Typed JSON helpers available on every [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    /// Loads and decodes the value at `key`.
    async fn get_json<T>(&self, key: &str) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Encodes and stores `value` at `key`.
    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> StorageResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let encoded = serde_json::to_value(value)?;
        self.set(key, encoded, ttl).await
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_token_debug_is_redacted() {
        let token = LockToken::from_string("secret-owner");
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret-owner"));
        assert_eq!(token.as_str(), "secret-owner");
    }

    #[test]
    fn test_lock_tokens_are_unique() {
        assert_ne!(LockToken::generate(), LockToken::generate());
    }
}
