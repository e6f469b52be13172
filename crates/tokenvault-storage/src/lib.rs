//! Key-value storage abstraction for TokenVault.
//!
//! This crate defines the [`KvStore`] trait that every TokenVault service
//! persists through, together with:
//!
//! - [`InMemoryKvStore`] - a process-local provider built on `dashmap`
//! - [`StorageConfig`] - provider selection shared by the server
//! - [`StorageError`] - the provider-independent error type
//!
//! Remote providers live in `tokenvault-redis` and `tokenvault-postgres`.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tokenvault_storage::{InMemoryKvStore, KvStore, KvStoreExt};
//!
//! let store = InMemoryKvStore::new();
//! store.set_json("session:abc", &session, Some(Duration::from_secs(3600))).await?;
//! let hits = store.incr("rate_limit:refresh:abc", 1).await?;
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod pattern;
pub mod traits;

pub use config::{BackendKind, StorageConfig, create_memory_store};
pub use error::{ErrorCategory, StorageError, StorageResult};
pub use memory::InMemoryKvStore;
pub use pattern::GlobPattern;
pub use traits::{DynKvStore, KvStore, KvStoreExt, LockToken};
