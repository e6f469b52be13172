//! PostgreSQL storage backend for TokenVault.
//!
//! Emulates the key-value contract on two tables:
//!
//! - `kv_entries` - one row per key with a JSONB value, a kind
//!   (`value` or `set`) and an optional `expires_at`
//! - `kv_set_members` - set members, cascading from their parent key
//!
//! Expired rows are filtered out on every read and deleted lazily on write;
//! [`KvStore::purge_expired`] removes the rest. All expiry arithmetic uses the
//! database clock so several application nodes agree on it.
//!
//! # Example
//!
//! ```ignore
//! use tokenvault_postgres::PostgresKvStore;
//!
//! let store = PostgresKvStore::connect("postgres://localhost/tokenvault").await?;
//! store.ensure_schema().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx_core::pool::{Pool, PoolOptions};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::Postgres;
use tokenvault_storage::{KvStore, LockToken, StorageError, StorageResult};

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS kv_entries (
        key         TEXT PRIMARY KEY,
        kind        TEXT NOT NULL DEFAULT 'value',
        value       JSONB NOT NULL DEFAULT 'null'::jsonb,
        expires_at  TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS kv_entries_expires_at_idx
        ON kv_entries (expires_at) WHERE expires_at IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kv_set_members (
        key     TEXT NOT NULL REFERENCES kv_entries (key) ON DELETE CASCADE,
        member  TEXT NOT NULL,
        PRIMARY KEY (key, member)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS kv_entries_key_pattern_idx
        ON kv_entries (key text_pattern_ops)
    "#,
];

/// Filter for rows that have not expired.
const LIVE: &str = "(expires_at IS NULL OR expires_at > NOW())";

const LOCK_POLL_START: Duration = Duration::from_millis(20);
const LOCK_POLL_MAX: Duration = Duration::from_millis(500);

// =============================================================================
// Helpers
// =============================================================================

fn database_error(err: sqlx_core::Error) -> StorageError {
    match err {
        sqlx_core::Error::PoolTimedOut
        | sqlx_core::Error::PoolClosed
        | sqlx_core::Error::Io(_)
        | sqlx_core::Error::Tls(_) => StorageError::connection_error(err.to_string()),
        other => StorageError::backend(other.to_string()),
    }
}

/// TTL in whole milliseconds for binding as `bigint`.
fn ttl_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1))
}

/// Translates a glob (`*`, `?`) into a LIKE pattern with `\` as escape.
fn glob_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        match ch {
            '*' => like.push('%'),
            '?' => like.push('_'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(ch);
            }
            other => like.push(other),
        }
    }
    like
}

// =============================================================================
// PostgreSQL Key-Value Store
// =============================================================================

/// PostgreSQL-backed [`KvStore`].
#[derive(Debug, Clone)]
pub struct PostgresKvStore {
    pool: Arc<PgPool>,
}

impl PostgresKvStore {
    /// Create new storage with an existing connection pool.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create new storage by connecting to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PoolOptions::<Postgres>::new()
            .connect(database_url)
            .await
            .map_err(database_error)?;
        tracing::info!(backend = "postgres", "connected to key-value store");
        Ok(Self::new(Arc::new(pool)))
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            query(statement)
                .execute(self.pool())
                .await
                .map_err(database_error)?;
        }
        Ok(())
    }

    /// Deletes `key` if its lease has run out, cascading to set members.
    async fn drop_if_expired(&self, key: &str) -> StorageResult<()> {
        query("DELETE FROM kv_entries WHERE key = $1 AND expires_at IS NOT NULL AND expires_at <= NOW()")
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(database_error)?;
        Ok(())
    }

    async fn live_kind(&self, key: &str) -> StorageResult<Option<String>> {
        query_scalar(&format!("SELECT kind FROM kv_entries WHERE key = $1 AND {LIVE}"))
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .map_err(database_error)
    }
}

#[async_trait]
impl KvStore for PostgresKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let row: Option<(String, Value)> = query_as(&format!(
            "SELECT kind, value FROM kv_entries WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(database_error)?;

        match row {
            Some((kind, _)) if kind == "set" => Err(StorageError::wrong_type(key, "value")),
            Some((_, value)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let mut tx = self.pool().begin().await.map_err(database_error)?;

        query("DELETE FROM kv_set_members WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(database_error)?;

        query(
            r#"
            INSERT INTO kv_entries (key, kind, value, expires_at)
            VALUES ($1, 'value', $2,
                    CASE WHEN $3::bigint IS NULL THEN NULL
                         ELSE NOW() + $3::bigint * INTERVAL '1 millisecond' END)
            ON CONFLICT (key) DO UPDATE
                SET kind = 'value', value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(ttl_millis(ttl))
        .execute(&mut *tx)
        .await
        .map_err(database_error)?;

        tx.commit().await.map_err(database_error)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let result = query(&format!("DELETE FROM kv_entries WHERE key = $1 AND {LIVE}"))
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(database_error)?;
        self.drop_if_expired(key).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.live_kind(key).await?.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let result = query(&format!(
            "UPDATE kv_entries SET expires_at = NOW() + $2::bigint * INTERVAL '1 millisecond' \
             WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .bind(ttl_millis(Some(ttl)))
        .execute(self.pool())
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        let remaining: Option<Option<i64>> = query_scalar(&format!(
            "SELECT (EXTRACT(EPOCH FROM (expires_at - NOW())) * 1000)::bigint \
             FROM kv_entries WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(database_error)?;

        Ok(remaining
            .flatten()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis))
    }

    async fn scan(&self, pattern: &str) -> StorageResult<Vec<String>> {
        query_scalar(&format!(
            r"SELECT key FROM kv_entries WHERE key LIKE $1 ESCAPE '\' AND {LIVE} ORDER BY key"
        ))
        .bind(glob_to_like(pattern))
        .fetch_all(self.pool())
        .await
        .map_err(database_error)
    }

    async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, Value)> = query_as(&format!(
            "SELECT key, value FROM kv_entries WHERE key = ANY($1) AND kind = 'value' AND {LIVE}"
        ))
        .bind(keys)
        .fetch_all(self.pool())
        .await
        .map_err(database_error)?;

        let mut found: std::collections::HashMap<String, Value> = rows.into_iter().collect();
        Ok(keys.iter().map(|key| found.remove(key)).collect())
    }

    async fn mset(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let millis = ttl_millis(ttl);
        let mut tx = self.pool().begin().await.map_err(database_error)?;
        for (key, value) in &entries {
            query(
                r#"
                INSERT INTO kv_entries (key, kind, value, expires_at)
                VALUES ($1, 'value', $2,
                        CASE WHEN $3::bigint IS NULL THEN NULL
                             ELSE NOW() + $3::bigint * INTERVAL '1 millisecond' END)
                ON CONFLICT (key) DO UPDATE
                    SET kind = 'value', value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(millis)
            .execute(&mut *tx)
            .await
            .map_err(database_error)?;
        }
        tx.commit().await.map_err(database_error)
    }

    async fn incr(&self, key: &str, delta: i64) -> StorageResult<i64> {
        let value: Option<i64> = query_scalar(
            r#"
            INSERT INTO kv_entries (key, kind, value, expires_at)
            VALUES ($1, 'value', to_jsonb($2::bigint), NULL)
            ON CONFLICT (key) DO UPDATE SET
                value = CASE
                    WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= NOW()
                        THEN to_jsonb($2::bigint)
                    ELSE to_jsonb((kv_entries.value #>> '{}')::bigint + $2::bigint)
                END,
                expires_at = CASE
                    WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= NOW()
                        THEN NULL
                    ELSE kv_entries.expires_at
                END
            WHERE kv_entries.kind = 'value'
            RETURNING (value #>> '{}')::bigint
            "#,
        )
        .bind(key)
        .bind(delta)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| match e {
            sqlx_core::Error::Database(_) => StorageError::wrong_type(key, "integer"),
            other => database_error(other),
        })?;

        value.ok_or_else(|| StorageError::wrong_type(key, "integer"))
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        self.drop_if_expired(key).await?;

        query("INSERT INTO kv_entries (key, kind) VALUES ($1, 'set') ON CONFLICT (key) DO NOTHING")
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(database_error)?;

        if self.live_kind(key).await?.as_deref() != Some("set") {
            return Err(StorageError::wrong_type(key, "set"));
        }

        let result = query(
            "INSERT INTO kv_set_members (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(key)
        .bind(member)
        .execute(self.pool())
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        match self.live_kind(key).await?.as_deref() {
            None => return Ok(false),
            Some("set") => {}
            Some(_) => return Err(StorageError::wrong_type(key, "set")),
        }

        let result = query("DELETE FROM kv_set_members WHERE key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(self.pool())
            .await
            .map_err(database_error)?;

        // Empty sets disappear, as in Redis.
        query(
            "DELETE FROM kv_entries WHERE key = $1 AND kind = 'set' \
             AND NOT EXISTS (SELECT 1 FROM kv_set_members WHERE key = $1)",
        )
        .bind(key)
        .execute(self.pool())
        .await
        .map_err(database_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        match self.live_kind(key).await?.as_deref() {
            None => return Ok(Vec::new()),
            Some("set") => {}
            Some(_) => return Err(StorageError::wrong_type(key, "set")),
        }

        query_scalar("SELECT member FROM kv_set_members WHERE key = $1 ORDER BY member")
            .bind(key)
            .fetch_all(self.pool())
            .await
            .map_err(database_error)
    }

    async fn lock_acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait: Option<Duration>,
    ) -> StorageResult<Option<LockToken>> {
        let token = LockToken::generate();
        let deadline = wait.map(|wait| tokio::time::Instant::now() + wait);
        let mut backoff = LOCK_POLL_START;

        loop {
            let acquired: Option<String> = query_scalar(
                r#"
                INSERT INTO kv_entries (key, kind, value, expires_at)
                VALUES ($1, 'value', to_jsonb($2::text), NOW() + $3::bigint * INTERVAL '1 millisecond')
                ON CONFLICT (key) DO UPDATE
                    SET kind = 'value', value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                    WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= NOW()
                RETURNING key
                "#,
            )
            .bind(name)
            .bind(token.as_str())
            .bind(ttl_millis(Some(ttl)))
            .fetch_optional(self.pool())
            .await
            .map_err(database_error)?;

            if acquired.is_some() {
                return Ok(Some(token));
            }

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
        let result = query(&format!(
            "DELETE FROM kv_entries WHERE key = $1 AND value = to_jsonb($2::text) AND {LIVE}"
        ))
        .bind(name)
        .bind(token.as_str())
        .execute(self.pool())
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> StorageResult<u64> {
        let result =
            query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= NOW()")
                .execute(self.pool())
                .await
                .map_err(database_error)?;
        Ok(result.rows_affected())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_like() {
        assert_eq!(glob_to_like("audit:user:u1:*"), "audit:user:u1:%");
        assert_eq!(glob_to_like("token:?:x"), "token:_:x");
        assert_eq!(glob_to_like("rate_limit:*"), r"rate\_limit:%");
        assert_eq!(glob_to_like("100%"), r"100\%");
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(None), None);
        assert_eq!(ttl_millis(Some(Duration::ZERO)), Some(1));
        assert_eq!(ttl_millis(Some(Duration::from_secs(60))), Some(60_000));
    }

    #[test]
    fn test_schema_statements_are_idempotent() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"));
        }
    }
}
