//! Rate limiting with failure backoff.
//!
//! Per-identifier limiting is a fixed window counter plus an exponential
//! backoff that kicks in after failures. The global limiter caps total
//! throughput per wall-clock second across every identifier.

use std::time::Duration;

use serde_json::json;
use tokenvault_storage::DynKvStore;

use crate::clock::DynClock;
use crate::config::RateLimitingConfig;
use crate::keys;
use crate::{AuthError, AuthResult};

const GLOBAL_WINDOW: Duration = Duration::from_secs(2);

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Set when denied.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: None,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after: Some(retry_after),
        }
    }

    /// Turns a denial into [`AuthError::RateLimited`].
    pub fn into_result(self) -> AuthResult<()> {
        match self.retry_after {
            Some(retry_after) if !self.allowed => Err(AuthError::rate_limited(retry_after)),
            _ => Ok(()),
        }
    }
}

/// Per-operation, per-identifier limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: DynKvStore,
    config: RateLimitingConfig,
}

impl RateLimiter {
    pub fn new(store: DynKvStore, config: RateLimitingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitingConfig {
        &self.config
    }

    /// Counts one attempt and decides whether it may proceed.
    pub async fn check(&self, operation: &str, identifier: &str) -> AuthResult<RateLimitDecision> {
        if !self.config.enabled {
            return Ok(RateLimitDecision::allow(self.config.max_requests));
        }

        let backoff_key = keys::rate_limit_backoff(operation, identifier);
        if self.store.exists(&backoff_key).await? {
            let retry_after = self
                .store
                .ttl(&backoff_key)
                .await?
                .unwrap_or(Duration::from_secs(1));
            tracing::debug!(operation, identifier, ?retry_after, "Rate limit backoff active");
            return Ok(RateLimitDecision::deny(retry_after));
        }

        let key = keys::rate_limit(operation, identifier);
        let count = self.store.incr(&key, 1).await?;
        if count == 1 {
            self.store.expire(&key, self.config.window).await?;
        }

        let count = u64::try_from(count).unwrap_or(0);
        if count > self.config.max_requests {
            let retry_after = match self.store.ttl(&key).await? {
                Some(ttl) => ttl,
                None => {
                    // Counter lost its expiry; restart the window.
                    self.store.expire(&key, self.config.window).await?;
                    self.config.window
                }
            };
            tracing::debug!(operation, identifier, count, "Rate limit exceeded");
            return Ok(RateLimitDecision::deny(retry_after));
        }

        Ok(RateLimitDecision::allow(self.config.max_requests - count))
    }

    /// Records a failed attempt and arms the backoff.
    ///
    /// Returns the backoff now in force.
    pub async fn record_failure(&self, operation: &str, identifier: &str) -> AuthResult<Duration> {
        if !self.config.enabled || !self.config.backoff_enabled {
            return Ok(Duration::ZERO);
        }

        let failures_key = keys::rate_limit_failures(operation, identifier);
        let failures = self.store.incr(&failures_key, 1).await?;
        self.store
            .expire(&failures_key, self.config.max_backoff)
            .await?;

        let backoff = self.backoff_for(failures);
        self.store
            .set(
                &keys::rate_limit_backoff(operation, identifier),
                json!(failures),
                Some(backoff),
            )
            .await?;

        tracing::debug!(operation, identifier, failures, ?backoff, "Backoff armed");
        Ok(backoff)
    }

    /// Clears failures and backoff after a successful attempt.
    pub async fn record_success(&self, operation: &str, identifier: &str) -> AuthResult<()> {
        self.store
            .delete(&keys::rate_limit_failures(operation, identifier))
            .await?;
        self.store
            .delete(&keys::rate_limit_backoff(operation, identifier))
            .await?;
        Ok(())
    }

    /// Forgets everything about the identifier.
    pub async fn reset(&self, operation: &str, identifier: &str) -> AuthResult<()> {
        self.store
            .delete(&keys::rate_limit(operation, identifier))
            .await?;
        self.record_success(operation, identifier).await
    }

    /// `min(multiplier ^ failures, max_backoff)` seconds.
    fn backoff_for(&self, failures: i64) -> Duration {
        let exponent = i32::try_from(failures.max(1)).unwrap_or(i32::MAX);
        let max = self.config.max_backoff.as_secs_f64();
        let secs = self.config.backoff_multiplier.powi(exponent).min(max);
        Duration::try_from_secs_f64(secs).unwrap_or(self.config.max_backoff)
    }
}

/// Process-wide ceiling on requests per second.
#[derive(Clone)]
pub struct GlobalRateLimiter {
    store: DynKvStore,
    clock: DynClock,
    max_per_second: u64,
}

impl GlobalRateLimiter {
    /// A ceiling of zero disables the limiter.
    pub fn new(store: DynKvStore, clock: DynClock, max_per_second: u64) -> Self {
        Self {
            store,
            clock,
            max_per_second,
        }
    }

    pub async fn check(&self) -> AuthResult<RateLimitDecision> {
        if self.max_per_second == 0 {
            return Ok(RateLimitDecision::allow(u64::MAX));
        }

        let key = keys::rate_limit_global(self.clock.now().unix_timestamp());
        let count = self.store.incr(&key, 1).await?;
        if count == 1 {
            self.store.expire(&key, GLOBAL_WINDOW).await?;
        }

        let count = u64::try_from(count).unwrap_or(0);
        if count > self.max_per_second {
            tracing::warn!(count, limit = self.max_per_second, "Global rate limit exceeded");
            return Ok(RateLimitDecision::deny(Duration::from_secs(1)));
        }
        Ok(RateLimitDecision::allow(self.max_per_second - count))
    }
}
