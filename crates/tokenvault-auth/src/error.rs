//! Token and session error types.
//!
//! This module defines every error a caller of the core can observe. The
//! variants are chosen so a caller knows whether to re-authenticate
//! (`InvalidCredential`, `SessionInvalid`), back off (`RateLimited`) or retry
//! later (`UpstreamExchange`).

use std::fmt;
use std::time::Duration;

use tokenvault_storage::StorageError;

/// Errors that can occur during token and session operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The refresh credential is unknown, malformed, expired or revoked.
    #[error("Invalid credential: {message}")]
    InvalidCredential {
        /// Description of why the credential was rejected.
        message: String,
    },

    /// The upstream identity provider could not be reached or failed.
    #[error("Upstream exchange failed: {message}")]
    UpstreamExchange {
        /// Description of the transport or provider failure.
        message: String,
    },

    /// Too many attempts; the caller must wait before trying again.
    #[error("Rate limited: retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// How long the caller should wait.
        retry_after: Duration,
    },

    /// The session is missing, in the wrong state, or timed out.
    #[error("Session invalid: {reason}")]
    SessionInvalid {
        /// Human-readable reason, e.g. `idle timeout`.
        reason: String,
    },

    /// The request is malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// An error occurred while storing or retrieving state.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidCredential` error.
    #[must_use]
    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::InvalidCredential {
            message: message.into(),
        }
    }

    /// Creates a new `UpstreamExchange` error.
    #[must_use]
    pub fn upstream_exchange(message: impl Into<String>) -> Self {
        Self::UpstreamExchange {
            message: message.into(),
        }
    }

    /// Creates a new `RateLimited` error.
    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Creates a new `SessionInvalid` error.
    #[must_use]
    pub fn session_invalid(reason: impl Into<String>) -> Self {
        Self::SessionInvalid {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this error was caused by the caller (4xx equivalent).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential { .. }
                | Self::RateLimited { .. }
                | Self::SessionInvalid { .. }
                | Self::InvalidRequest { .. }
        )
    }

    /// Returns `true` if this is a server-side failure (5xx equivalent).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns `true` if repeating the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamExchange { .. } | Self::RateLimited { .. } | Self::Storage { .. }
        )
    }

    /// Returns the retry hint for rate-limit errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidCredential { .. } => ErrorCategory::Credential,
            Self::UpstreamExchange { .. } => ErrorCategory::Upstream,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::SessionInvalid { .. } => ErrorCategory::Session,
            Self::InvalidRequest { .. } => ErrorCategory::Validation,
            Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the OAuth 2.0 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidCredential { .. } => "invalid_grant",
            Self::UpstreamExchange { .. } => "server_error",
            Self::RateLimited { .. } => "slow_down",
            Self::SessionInvalid { .. } => "invalid_token",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Storage { .. } => "server_error",
            Self::Configuration { .. } => "server_error",
            Self::Internal { .. } => "server_error",
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        Self::storage(err.to_string())
    }
}

/// Categories of errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Credential validation failures.
    Credential,
    /// Identity provider failures.
    Upstream,
    /// Rate limit rejections.
    RateLimit,
    /// Session state failures.
    Session,
    /// Request validation errors.
    Validation,
    /// Infrastructure/storage errors.
    Infrastructure,
    /// Configuration errors.
    Configuration,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential => write!(f, "credential"),
            Self::Upstream => write!(f, "upstream"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Session => write!(f, "session"),
            Self::Validation => write!(f, "validation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
