//! Storage error types for the key-value abstraction layer.
//!
//! Every provider maps its native failures onto [`StorageError`] so callers
//! never depend on a particular client library.

use std::fmt;

/// Errors that can occur during key-value storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested key does not exist.
    #[error("Key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The operation does not apply to the value stored at the key.
    #[error("Wrong type at {key}: expected {expected}")]
    WrongType {
        /// The key holding a value of the wrong type.
        key: String,
        /// The kind of value the operation expected.
        expected: &'static str,
    },

    /// A value could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Failed to connect to the storage provider.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// The storage provider rejected or failed the command.
    #[error("Backend error: {message}")]
    Backend {
        /// Description of the provider failure.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `WrongType` error.
    #[must_use]
    pub fn wrong_type(key: impl Into<String>, expected: &'static str) -> Self {
        Self::WrongType {
            key: key.into(),
            expected,
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
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

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a wrong type error.
    #[must_use]
    pub fn is_wrong_type(&self) -> bool {
        matches!(self, Self::WrongType { .. })
    }

    /// Returns `true` if the caller may retry the operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError { .. })
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } | Self::WrongType { .. } => ErrorCategory::Client,
            Self::Serialization { .. } => ErrorCategory::Data,
            Self::ConnectionError { .. } => ErrorCategory::Connection,
            Self::Backend { .. } | Self::Internal { .. } => ErrorCategory::Server,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Categories of storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The caller addressed a key incorrectly.
    Client,
    /// Stored data could not be decoded.
    Data,
    /// The provider is unreachable.
    Connection,
    /// The provider failed internally.
    Server,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Data => write!(f, "data"),
            Self::Connection => write!(f, "connection"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("session:abc");
        assert_eq!(err.to_string(), "Key not found: session:abc");

        let err = StorageError::wrong_type("user_sessions:u1", "set");
        assert_eq!(err.to_string(), "Wrong type at user_sessions:u1: expected set");
    }

    #[test]
    fn test_error_predicates() {
        assert!(StorageError::not_found("k").is_not_found());
        assert!(StorageError::wrong_type("k", "integer").is_wrong_type());
        assert!(StorageError::connection_error("refused").is_transient());
        assert!(!StorageError::backend("oops").is_transient());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::not_found("k").category(),
            ErrorCategory::Client
        );
        assert_eq!(
            StorageError::connection_error("down").category(),
            ErrorCategory::Connection
        );
        assert_eq!(ErrorCategory::Server.to_string(), "server");
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let storage: StorageError = err.into();
        assert!(matches!(storage, StorageError::Serialization { .. }));
    }
}
