//! Per-device session record.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::device::DeviceDescriptor;
use crate::types::CredentialPair;

/// Status derived from a session's time fields. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Expired,
    Revoked,
}

impl SessionStatus {
    /// Expired and revoked sessions never come back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's session on one device, stored at `session:{id}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,

    pub access_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub access_expires_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub refresh_expires_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    pub active: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    /// Creates an active session with a fresh id.
    pub fn new(user_id: impl Into<String>, credentials: &CredentialPair, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            access_token: credentials.access_token.clone(),
            access_expires_at: credentials.access_expires_at(),
            refresh_token: credentials.refresh_token.clone(),
            refresh_expires_at: credentials.refresh_expires_at(),
            scope: credentials.scope.clone(),
            created_at: now,
            last_activity: now,
            device: None,
            ip_address: None,
            active: true,
            revoked_at: None,
            revocation_reason: None,
            metadata: BTreeMap::new(),
        }
    }

    /// When the session's credentials run out: the refresh expiry if there
    /// is a refresh credential, the access expiry otherwise.
    pub fn credential_expiry(&self) -> Option<OffsetDateTime> {
        match &self.refresh_token {
            Some(_) => self.refresh_expires_at,
            None => Some(self.access_expires_at),
        }
    }

    /// Returns `true` once the session has been terminated.
    pub fn is_revoked(&self) -> bool {
        !self.active || self.revoked_at.is_some()
    }

    /// Derives the status at `now`. Checks run from most to least final.
    pub fn status(&self, now: OffsetDateTime, idle_timeout: Duration) -> SessionStatus {
        if self.is_revoked() {
            SessionStatus::Revoked
        } else if self.credential_expiry().is_some_and(|exp| now >= exp) {
            SessionStatus::Expired
        } else if now - self.last_activity > idle_timeout {
            SessionStatus::Idle
        } else {
            SessionStatus::Active
        }
    }

    /// Time since creation.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.created_at
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_activity = now;
    }

    pub fn revoke(&mut self, now: OffsetDateTime, reason: impl Into<String>) {
        self.active = false;
        self.revoked_at = Some(now);
        self.revocation_reason = Some(reason.into());
    }

    /// Replaces the embedded credentials with a newly issued pair.
    pub fn apply_credentials(&mut self, credentials: &CredentialPair) {
        self.access_token = credentials.access_token.clone();
        self.access_expires_at = credentials.access_expires_at();
        if let Some(refresh) = &credentials.refresh_token {
            self.refresh_token = Some(refresh.clone());
            self.refresh_expires_at = credentials.refresh_expires_at();
        }
        if credentials.scope.is_some() {
            self.scope = credentials.scope.clone();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("access_expires_at", &self.access_expires_at)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .field("device", &self.device)
            .field("ip_address", &self.ip_address)
            .field("active", &self.active)
            .field("revoked_at", &self.revoked_at)
            .finish_non_exhaustive()
    }
}
