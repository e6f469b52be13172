//! Audit event model.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::device::DeviceChange;
use crate::types::TokenKind;

/// Security-relevant event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    SessionCreated,
    SessionTerminated,
    TokenRefreshed,
    TokenRefreshFailed,
    TokenRevoked,
    TokenRotated,
    RateLimitExceeded,
    DeviceMismatch,
    IpMismatch,
    SuspiciousActivity,
    AccessGranted,
    AccessDenied,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionTerminated => "session_terminated",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::TokenRevoked => "token_revoked",
            Self::TokenRotated => "token_rotated",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::DeviceMismatch => "device_mismatch",
            Self::IpMismatch => "ip_mismatch",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::AccessGranted => "access_granted",
            Self::AccessDenied => "access_denied",
        }
    }

    /// Severity used when the caller does not pick one.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::SessionCreated
            | Self::SessionTerminated
            | Self::TokenRefreshed
            | Self::TokenRotated
            | Self::AccessGranted => Severity::Info,
            Self::TokenRefreshFailed
            | Self::TokenRevoked
            | Self::RateLimitExceeded
            | Self::DeviceMismatch
            | Self::IpMismatch
            | Self::AccessDenied => Severity::Warning,
            Self::SuspiciousActivity => Severity::Critical,
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditDetails {
    SessionCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        evicted_sessions: usize,
    },
    SessionTerminated {
        reason: String,
    },
    TokenRefreshed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_token_hash: Option<String>,
        new_token_hash: String,
        rotated: bool,
    },
    TokenRefreshFailed {
        token_fingerprint: String,
        error: String,
    },
    TokenRevoked {
        token_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<TokenKind>,
        reason: String,
        cascade: bool,
    },
    TokenRotated {
        rotation_count: u64,
    },
    RateLimitExceeded {
        operation: String,
        identifier: String,
        retry_after_secs: u64,
    },
    DeviceMismatch {
        expected: String,
        presented: String,
        changes: Vec<DeviceChange>,
    },
    IpMismatch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<String>,
        presented: String,
    },
    SuspiciousActivity {
        description: String,
    },
    Access {
        resource: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// A stored audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditEventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub details: AuditDetails,
    pub severity: Severity,
}

impl AuditEvent {
    /// Creates an event with the kind's default severity.
    pub fn new(kind: AuditEventKind, details: AuditDetails, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp,
            user_id: None,
            session_id: None,
            ip_address: None,
            user_agent: None,
            details,
            severity: kind.default_severity(),
        }
    }

    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn ip_address(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Who and where an event happened, for events raised deep inside a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditContext {
    pub fn new(user_id: Option<&str>, session_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Fills the event's actor fields.
    pub fn apply(&self, mut event: AuditEvent) -> AuditEvent {
        event.user_id = self.user_id.clone();
        event.session_id = self.session_id.clone();
        event.ip_address = self.ip_address.clone();
        event.user_agent = self.user_agent.clone();
        event
    }
}
