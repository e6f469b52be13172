//! Credential pair and credential metadata.
//!
//! # Security
//!
//! - Raw credential values only live inside [`CredentialPair`], whose `Debug`
//!   output is redacted
//! - [`CredentialMetadata`] carries the SHA-256 hash, never the credential

use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::crypto::hash_token;

/// Kind of bearer credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
    Id,
}

impl TokenKind {
    /// Storage and wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Id => "id",
        }
    }

    /// Parses an RFC 7009 `token_type_hint` (`access_token`, `refresh_token`).
    ///
    /// Unknown hints yield `None`; they are not an error per RFC 7009.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint {
            "access_token" | "access" => Some(Self::Access),
            "refresh_token" | "refresh" => Some(Self::Refresh),
            "id_token" | "id" => Some(Self::Id),
            _ => None,
        }
    }

    /// The RFC 7662 `token_type` label.
    pub fn as_hint(&self) -> &'static str {
        match self {
            Self::Access => "access_token",
            Self::Refresh => "refresh_token",
            Self::Id => "id_token",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// An access credential plus an optional refresh credential.
///
/// Immutable; every refresh produces a new pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,

    /// Access credential lifetime in seconds.
    pub expires_in: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Refresh credential lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default = "default_token_type")]
    pub token_type: String,

    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl CredentialPair {
    /// Creates a bearer pair issued at `issued_at`.
    pub fn new(
        access_token: impl Into<String>,
        expires_in: u64,
        issued_at: OffsetDateTime,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
            refresh_token: None,
            refresh_expires_in: None,
            scope: None,
            token_type: default_token_type(),
            issued_at,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>, expires_in: Option<u64>) -> Self {
        self.refresh_token = Some(token.into());
        self.refresh_expires_in = expires_in;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Absolute expiry of the access credential.
    pub fn access_expires_at(&self) -> OffsetDateTime {
        self.issued_at + seconds(self.expires_in)
    }

    /// Absolute expiry of the refresh credential, if it has a known lifetime.
    pub fn refresh_expires_at(&self) -> Option<OffsetDateTime> {
        self.refresh_token.as_ref()?;
        self.refresh_expires_in
            .map(|secs| self.issued_at + seconds(secs))
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("refresh_expires_in", &self.refresh_expires_in)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Persisted record describing one issued credential.
///
/// Stored at `token:{kind}:{hash}` and expired by the backend TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMetadata {
    /// SHA-256 hex hash of the credential.
    pub token_hash: String,
    pub kind: TokenKind,
    pub user_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub revoked: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

impl CredentialMetadata {
    /// Builds metadata for a raw credential, hashing it on the way in.
    pub fn issue(
        token: &str,
        kind: TokenKind,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        issued_at: OffsetDateTime,
        expires_at: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            token_hash: hash_token(token),
            kind,
            user_id: user_id.into(),
            session_id: session_id.into(),
            client_id: None,
            issued_at,
            expires_at,
            last_used_at: None,
            use_count: 0,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    /// Returns `true` if the credential has expired at `now`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Returns `true` if the credential is neither revoked nor expired.
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        !self.revoked && !self.is_expired(now)
    }

    /// Records one use.
    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_used_at = Some(now);
        self.use_count = self.use_count.saturating_add(1);
    }

    pub fn mark_revoked(&mut self, now: OffsetDateTime, reason: impl Into<String>) {
        self.revoked = true;
        self.revoked_at = Some(now);
        self.revocation_reason = Some(reason.into());
    }

    /// Remaining lifetime, used as the storage TTL. `None` means no expiry.
    pub fn remaining(&self, now: OffsetDateTime) -> Option<Duration> {
        self.expires_at.map(|exp| exp - now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_pair_expiry_timestamps() {
        let issued = datetime!(2024-01-01 00:00:00 UTC);
        let pair = CredentialPair::new("at", 3600, issued).with_refresh_token("rt", Some(86400));

        assert_eq!(pair.access_expires_at(), datetime!(2024-01-01 01:00:00 UTC));
        assert_eq!(
            pair.refresh_expires_at(),
            Some(datetime!(2024-01-02 00:00:00 UTC))
        );
        assert_eq!(pair.token_type, "Bearer");
    }

    #[test]
    fn test_pair_without_refresh_has_no_refresh_expiry() {
        let pair = CredentialPair::new("at", 60, OffsetDateTime::now_utc());
        assert_eq!(pair.refresh_expires_at(), None);
    }

    #[test]
    fn test_pair_debug_is_redacted() {
        let pair = CredentialPair::new("secret-access", 60, OffsetDateTime::now_utc())
            .with_refresh_token("secret-refresh", None);
        let debug = format!("{pair:?}");
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_pair_deserialize_defaults_token_type() {
        let pair: CredentialPair = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "expires_in": 300,
            "issued_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert!(pair.refresh_token.is_none());
    }

    #[test]
    fn test_token_kind_hints() {
        assert_eq!(TokenKind::from_hint("refresh_token"), Some(TokenKind::Refresh));
        assert_eq!(TokenKind::from_hint("access_token"), Some(TokenKind::Access));
        assert_eq!(TokenKind::from_hint("bogus"), None);
        assert_eq!(TokenKind::Access.as_hint(), "access_token");
        assert_eq!(TokenKind::Id.to_string(), "id");
    }

    #[test]
    fn test_metadata_hashes_token() {
        let now = datetime!(2024-01-01 00:00:00 UTC);
        let meta = CredentialMetadata::issue("raw", TokenKind::Access, "u1", "s1", now, None);
        assert_eq!(meta.token_hash, hash_token("raw"));
        assert!(!serde_json::to_string(&meta).unwrap().contains("\"raw\""));
    }

    #[test]
    fn test_metadata_validity() {
        let now = datetime!(2024-01-01 00:00:00 UTC);
        let mut meta = CredentialMetadata::issue(
            "raw",
            TokenKind::Refresh,
            "u1",
            "s1",
            now,
            Some(now + Duration::hours(1)),
        );
        assert!(meta.is_valid(now));
        assert!(!meta.is_valid(now + Duration::hours(1)));
        assert_eq!(meta.remaining(now), Some(Duration::hours(1)));

        meta.touch(now);
        meta.touch(now);
        assert_eq!(meta.use_count, 2);
        assert_eq!(meta.last_used_at, Some(now));

        meta.mark_revoked(now, "logout");
        assert!(!meta.is_valid(now));
        assert_eq!(meta.revocation_reason.as_deref(), Some("logout"));
    }

    #[test]
    fn test_metadata_json_roundtrip() {
        let now = datetime!(2024-01-01 00:00:00 UTC);
        let mut meta = CredentialMetadata::issue(
            "raw",
            TokenKind::Access,
            "u1",
            "s1",
            now,
            Some(now + Duration::minutes(5)),
        )
        .with_client_id(Some("web".to_string()));
        meta.touch(now);

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["kind"], "access");
        assert_eq!(value["clientId"], "web");

        let back: CredentialMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
    }
}
