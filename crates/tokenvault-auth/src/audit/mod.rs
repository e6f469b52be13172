//! Security audit trail for credential and session events.
//!
//! Events are persisted through the key-value store under a primary key
//! plus per-user, per-session and per-day index keys, and are mirrored to
//! `tracing` under the `tokenvault::audit` target.

pub mod event;
pub mod service;

pub use event::{AuditContext, AuditDetails, AuditEvent, AuditEventKind, Severity};
pub use service::{AuditQuery, AuditService, AuditStats};
