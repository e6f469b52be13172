//! Token introspection (RFC 7662).
//!
//! A credential is active when it has not been revoked and its stored
//! metadata is valid. For JWT credentials the unverified payload fills in
//! scope, username and the other claims the metadata does not carry.
//!
//! The response never says why a credential is inactive.

use serde::{Deserialize, Serialize};

use crate::AuthResult;
use crate::clock::DynClock;
use crate::crypto::hash_token;
use crate::revocation::RevocationService;
use crate::token::jwt::{self, JwtClaims};
use crate::token::metadata::MetadataStore;
use crate::types::{CredentialMetadata, TokenKind};

// =============================================================================
// Request / Response Types
// =============================================================================

/// Token introspection request.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionRequest {
    pub token: String,

    /// `access_token`, `refresh_token` or `id_token`. Unknown hints are ignored.
    #[serde(default)]
    pub token_type_hint: Option<String>,
}

impl IntrospectionRequest {
    pub fn hint(&self) -> Option<TokenKind> {
        self.token_type_hint.as_deref().and_then(TokenKind::from_hint)
    }
}

/// Token introspection response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// Expiration time (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Issued at time (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

impl IntrospectionResponse {
    /// The only response for revoked, unknown, expired or undecodable credentials.
    #[must_use]
    pub fn inactive() -> Self {
        Self::default()
    }

    /// Claims only enrich what the stored metadata already vouches for.
    fn active(metadata: &CredentialMetadata, claims: Option<&JwtClaims>) -> Self {
        let claim = |f: fn(&JwtClaims) -> Option<String>| claims.and_then(f);

        Self {
            active: true,
            scope: claim(|c| c.scope.clone()),
            client_id: metadata
                .client_id
                .clone()
                .or_else(|| claim(|c| c.client().map(str::to_string))),
            username: claim(|c| c.user_name().map(str::to_string)),
            token_type: Some(metadata.kind.as_hint().to_string()),
            exp: metadata
                .expires_at
                .map(|t| t.unix_timestamp())
                .or_else(|| claims.and_then(|c| c.exp)),
            iat: Some(metadata.issued_at.unix_timestamp()),
            sub: claim(|c| c.sub.clone()).or_else(|| Some(metadata.user_id.clone())),
        }
    }
}

// =============================================================================
// Introspector
// =============================================================================

/// Answers "is this credential active, and what is it?".
#[derive(Clone)]
pub struct TokenIntrospector {
    clock: DynClock,
    revocation: RevocationService,
    metadata: MetadataStore,
}

impl TokenIntrospector {
    pub fn new(clock: DynClock, revocation: RevocationService, metadata: MetadataStore) -> Self {
        Self {
            clock,
            revocation,
            metadata,
        }
    }

    /// # Errors
    ///
    /// Only storage failures are errors; every other outcome is a response.
    pub async fn introspect(&self, request: &IntrospectionRequest) -> AuthResult<IntrospectionResponse> {
        let token_hash = hash_token(&request.token);
        if self.revocation.is_revoked(&token_hash).await? {
            return Ok(IntrospectionResponse::inactive());
        }

        let now = self.clock.now();
        let metadata = self.metadata.find(&token_hash, request.hint()).await?;
        // A well-formed JWT alone proves nothing; unknown credentials are inactive.
        let Some(metadata) = metadata.filter(|m| m.is_valid(now)) else {
            return Ok(IntrospectionResponse::inactive());
        };
        let claims = jwt::decode_unverified(&request.token);
        Ok(IntrospectionResponse::active(&metadata, claims.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::Harness;
    use crate::token::jwt::encode_unsigned;
    use serde_json::json;

    fn introspector(h: &Harness) -> TokenIntrospector {
        TokenIntrospector::new(h.clock.clone(), h.revocation(), h.metadata())
    }

    fn request(token: &str, hint: Option<&str>) -> IntrospectionRequest {
        IntrospectionRequest {
            token: token.to_string(),
            token_type_hint: hint.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_known_token_is_active() {
        let h = Harness::new();
        let session = h.seed_session("u1", "rt-0").await;

        let response = introspector(&h)
            .introspect(&request("at-0", Some("access_token")))
            .await
            .unwrap();
        assert!(response.active);
        assert_eq!(response.sub.as_deref(), Some("u1"));
        assert_eq!(response.token_type.as_deref(), Some("access_token"));
        assert_eq!(
            response.exp,
            Some(session.access_expires_at.unix_timestamp())
        );

        // Wrong hint still finds the record.
        let response = introspector(&h)
            .introspect(&request("rt-0", Some("access_token")))
            .await
            .unwrap();
        assert!(response.active);
        assert_eq!(response.token_type.as_deref(), Some("refresh_token"));
    }

    #[tokio::test]
    async fn test_revoked_token_is_inactive() {
        let h = Harness::new();
        h.seed_session("u1", "rt-0").await;
        h.revocation()
            .revoke_token("at-0", None, "logout", false)
            .await
            .unwrap();

        let response = introspector(&h)
            .introspect(&request("at-0", None))
            .await
            .unwrap();
        assert_eq!(response, IntrospectionResponse::inactive());
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({ "active": false }));
    }

    #[tokio::test]
    async fn test_expired_metadata_is_inactive() {
        let h = Harness::new();
        h.seed_session("u1", "rt-0").await;
        h.clock.advance(time::Duration::hours(2));

        let response = introspector(&h)
            .introspect(&request("at-0", None))
            .await
            .unwrap();
        assert!(!response.active);
    }

    #[tokio::test]
    async fn test_unknown_opaque_token_is_inactive() {
        let h = Harness::new();
        let response = introspector(&h)
            .introspect(&request("who-knows", None))
            .await
            .unwrap();
        assert!(!response.active);
    }

    #[tokio::test]
    async fn test_unknown_jwt_is_inactive() {
        let h = Harness::new();
        let now = h.clock.now();
        let token = encode_unsigned(&json!({
            "sub": "u9",
            "exp": (now + time::Duration::minutes(5)).unix_timestamp(),
            "scope": "openid profile"
        }));

        let response = introspector(&h)
            .introspect(&request(&token, None))
            .await
            .unwrap();
        assert_eq!(response, IntrospectionResponse::inactive());
    }

    #[tokio::test]
    async fn test_known_jwt_is_enriched_from_payload() {
        let h = Harness::new();
        let now = h.clock.now();
        let token = encode_unsigned(&json!({
            "sub": "u9",
            "exp": (now + time::Duration::minutes(5)).unix_timestamp(),
            "iat": now.unix_timestamp(),
            "scope": "openid profile",
            "azp": "web",
            "preferred_username": "alice"
        }));
        let record = CredentialMetadata::issue(
            &token,
            TokenKind::Access,
            "u9",
            "s-1",
            now,
            Some(now + time::Duration::minutes(5)),
        );
        h.metadata().save(&record, now).await.unwrap();

        let response = introspector(&h)
            .introspect(&request(&token, None))
            .await
            .unwrap();
        assert!(response.active);
        assert_eq!(response.sub.as_deref(), Some("u9"));
        assert_eq!(response.client_id.as_deref(), Some("web"));
        assert_eq!(response.username.as_deref(), Some("alice"));
        assert_eq!(response.scope.as_deref(), Some("openid profile"));
        assert_eq!(response.token_type.as_deref(), Some("access_token"));

        h.clock.advance(time::Duration::minutes(6));
        let response = introspector(&h)
            .introspect(&request(&token, None))
            .await
            .unwrap();
        assert!(!response.active);
    }
}
