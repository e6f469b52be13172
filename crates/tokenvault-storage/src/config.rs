//! Storage backend selection.

use serde::{Deserialize, Serialize};

use crate::memory::InMemoryKvStore;
use crate::traits::DynKvStore;

/// Supported key-value providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local store backed by a concurrent hash map.
    #[default]
    Memory,
    /// Redis or any RESP-compatible server.
    Redis,
    /// PostgreSQL tables.
    Postgres,
}

impl BackendKind {
    /// Returns `true` if the provider needs a connection URL.
    #[must_use]
    pub fn requires_url(self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

/// Storage configuration.
///
/// ```toml
/// [storage]
/// backend = "redis"
/// url = "redis://127.0.0.1:6379"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which provider to use.
    pub backend: BackendKind,
    /// Connection URL for remote providers.
    pub url: Option<String>,
}

impl StorageConfig {
    /// Checks that remote providers have a URL.
    ///
    /// # Errors
    ///
    /// Returns a message naming the missing setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.backend.requires_url() && self.url.as_deref().is_none_or(str::is_empty) {
            return Err(format!("storage.url is required for the {} backend", self.backend));
        }
        Ok(())
    }
}

/// Creates a new in-memory store behind the shared trait object.
#[must_use]
pub fn create_memory_store() -> DynKvStore {
    std::sync::Arc::new(InMemoryKvStore::new())
}
