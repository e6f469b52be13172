//! # tokenvault-auth
//!
//! Token lifecycle and session management for TokenVault.
//!
//! This crate provides:
//! - Refresh credential exchange against an upstream token endpoint
//! - Refresh credential rotation with a grace window and atomic locking
//! - Session tracking with idle/absolute timeouts and device binding
//! - Revocation with session cascade
//! - Per-identifier and global rate limiting with exponential backoff
//! - A persisted security audit trail
//!
//! ## Modules
//!
//! - [`config`] - Service configuration and validation
//! - [`token`] - Refresh, introspection and upstream exchange
//! - [`session`] - Session persistence and lifecycle management
//! - [`revocation`] - Revocation list and cascade
//! - [`rate_limit`] - Sliding window limiter and backoff
//! - [`audit`] - Security event audit logging
//! - [`http`] - Axum handlers for the token endpoints
//!
//! All state lives behind [`tokenvault_storage::KvStore`], so every service
//! can be backed by memory, Redis or PostgreSQL.

pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod http;
pub mod keys;
pub mod rate_limit;
pub mod revocation;
pub mod session;
pub mod token;
pub mod types;

#[cfg(test)]
mod testing;

pub use audit::{AuditContext, AuditEvent, AuditEventKind, AuditQuery, AuditService, Severity};
pub use clock::{Clock, DynClock, ManualClock, SystemClock};
pub use config::{
    AuditConfig, AuthConfig, ConfigError, RateLimitingConfig, RevocationConfig, SessionConfig,
    TokenConfig, UpstreamConfig,
};
pub use device::{DeviceComparison, DeviceDescriptor};
pub use error::{AuthError, ErrorCategory};
pub use http::{AuthState, router};
pub use rate_limit::{GlobalRateLimiter, RateLimitDecision, RateLimiter};
pub use revocation::RevocationService;
pub use session::{SessionManager, SessionStore, ValidationOutcome};
pub use token::{
    HttpTokenExchanger, IntrospectionRequest, IntrospectionResponse, MetadataStore,
    RefreshOutcome, RefreshRequest, TokenExchanger, TokenIntrospector, TokenRefreshService,
};
pub use types::{
    CredentialMetadata, CredentialPair, RevocationRecord, RotationState, Session, SessionStatus,
    TokenKind,
};

/// Type alias for token and session results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tokenvault_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::audit::{AuditContext, AuditService};
    pub use crate::clock::{Clock, DynClock, SystemClock};
    pub use crate::config::{AuthConfig, ConfigError};
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::http::{AuthState, router};
    pub use crate::rate_limit::{GlobalRateLimiter, RateLimiter};
    pub use crate::revocation::RevocationService;
    pub use crate::session::{SessionManager, SessionStore};
    pub use crate::token::{
        HttpTokenExchanger, MetadataStore, TokenIntrospector, TokenRefreshService,
    };
    pub use crate::types::{CredentialPair, Session, SessionStatus, TokenKind};
}
