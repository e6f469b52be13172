//! Token and session configuration.
//!
//! All durations are written in humantime notation (`"30m"`, `"24h"`,
//! `"7days"`) and every section falls back to its defaults when omitted.
//!
//! # Example (TOML)
//!
//! ```toml
//! [auth.tokens]
//! rotation_enabled = true
//! grace_period = "60s"
//! refresh_buffer = "5m"
//!
//! [auth.sessions]
//! max_sessions_per_user = 10
//! idle_timeout = "30m"
//! absolute_timeout = "24h"
//!
//! [auth.upstream]
//! token_endpoint = "https://idp.example.com/oauth/token"
//! client_id = "tokenvault"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the token and session core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Credential lifetimes and rotation policy.
    pub tokens: TokenConfig,

    /// Session limits, timeouts and binding.
    pub sessions: SessionConfig,

    /// Rate limiting configuration.
    pub rate_limiting: RateLimitingConfig,

    /// Audit configuration.
    pub audit: AuditConfig,

    /// Revocation record retention.
    pub revocation: RevocationConfig,

    /// Upstream identity provider used for refresh exchanges.
    pub upstream: UpstreamConfig,
}

/// Credential lifetime and rotation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Access token lifetime when the provider does not report one.
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,

    /// Refresh token lifetime when the provider does not report one.
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,

    /// Issue a new refresh token on every refresh.
    pub rotation_enabled: bool,

    /// How long the previous refresh token stays valid after rotation.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Proactively refresh when the access token expires within this window.
    #[serde(with = "humantime_serde")]
    pub refresh_buffer: Duration,

    /// Serialize rotation per session through the storage lock.
    pub atomic_rotation: bool,

    /// Lease of the per-session rotation lock. Must cover the upstream timeout.
    #[serde(with = "humantime_serde")]
    pub rotation_lock_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_lifetime: Duration::from_secs(3600),
            refresh_token_lifetime: Duration::from_secs(30 * 24 * 3600),
            rotation_enabled: true,
            grace_period: Duration::from_secs(60),
            refresh_buffer: Duration::from_secs(300),
            atomic_rotation: true,
            rotation_lock_ttl: Duration::from_secs(15),
        }
    }
}

/// Session limits and binding configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum concurrent sessions per user.
    pub max_sessions_per_user: usize,

    /// Sessions without activity for this long become idle.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Hard cap on a session's lifetime regardless of activity.
    #[serde(with = "humantime_serde")]
    pub absolute_timeout: Duration,

    /// Compare presented devices against the session's device.
    pub device_binding: bool,

    /// Audit client IP changes.
    pub ip_binding: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            absolute_timeout: Duration::from_secs(24 * 3600),
            device_binding: true,
            ip_binding: true,
        }
    }
}

/// Rate limiting configuration.
///
/// Controls the sliding window on refresh attempts, the failure backoff and
/// the process-wide ceiling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Enable per-identifier limiting.
    pub enabled: bool,

    /// Length of the counting window.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Requests allowed per identifier per window.
    pub max_requests: u64,

    /// Enable exponential backoff after failures.
    pub backoff_enabled: bool,

    /// Base of the exponential backoff.
    pub backoff_multiplier: f64,

    /// Upper bound on a single backoff.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Requests allowed per wall-clock second across all identifiers.
    pub global_max_per_second: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 10,
            backoff_enabled: true,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(3600),
            global_max_per_second: 1000,
        }
    }
}

/// Audit logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Persist audit events (log lines are always written).
    pub enabled: bool,

    /// How long persisted events are kept.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

/// Revocation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// How long revocation records are kept.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Upstream identity provider configuration.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// OAuth 2.0 token endpoint that accepts `grant_type=refresh_token`.
    pub token_endpoint: Option<String>,

    /// Client id sent with exchange requests.
    pub client_id: Option<String>,

    /// Client secret sent with exchange requests.
    pub client_secret: Option<String>,

    /// Request timeout for the exchange call.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            token_endpoint: None,
            client_id: None,
            client_secret: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl AuthConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - The grace period is not shorter than the refresh token lifetime
    /// - The session limit, rate window or request budget is zero
    /// - The idle timeout is not shorter than the absolute timeout
    /// - The backoff multiplier is below 1.0
    /// - The upstream endpoint is not a valid URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.grace_period >= self.tokens.refresh_token_lifetime {
            return Err(ConfigError::InvalidValue(
                "tokens.grace_period must be shorter than tokens.refresh_token_lifetime"
                    .to_string(),
            ));
        }

        if self.tokens.atomic_rotation && self.tokens.rotation_lock_ttl < self.upstream.timeout {
            return Err(ConfigError::InvalidValue(
                "tokens.rotation_lock_ttl must be at least upstream.timeout".to_string(),
            ));
        }

        if self.sessions.max_sessions_per_user == 0 {
            return Err(ConfigError::InvalidValue(
                "sessions.max_sessions_per_user must be > 0".to_string(),
            ));
        }

        if self.sessions.idle_timeout >= self.sessions.absolute_timeout {
            return Err(ConfigError::InvalidValue(
                "sessions.idle_timeout must be shorter than sessions.absolute_timeout".to_string(),
            ));
        }

        if self.rate_limiting.enabled {
            if self.rate_limiting.window.is_zero() {
                return Err(ConfigError::InvalidValue(
                    "rate_limiting.window must be > 0".to_string(),
                ));
            }
            if self.rate_limiting.max_requests == 0 {
                return Err(ConfigError::InvalidValue(
                    "rate_limiting.max_requests must be > 0".to_string(),
                ));
            }
        }

        if self.rate_limiting.backoff_enabled && self.rate_limiting.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "rate_limiting.backoff_multiplier must be >= 1.0, got {}",
                self.rate_limiting.backoff_multiplier
            )));
        }

        if let Some(endpoint) = &self.upstream.token_endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                ConfigError::InvalidValue(format!("upstream.token_endpoint '{endpoint}': {e}"))
            })?;
        }

        if self.upstream.timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "upstream.timeout must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
