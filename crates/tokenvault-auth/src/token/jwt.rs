//! Unverified JWT payload decoding.
//!
//! Only used to read timing and descriptive claims from access
//! credentials issued upstream. The signature is NOT checked, so nothing
//! decoded here may be used for an authorization decision.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use time::OffsetDateTime;

/// Claims of interest in an access credential payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JwtClaims {
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub azp: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
}

impl JwtClaims {
    /// `client_id`, falling back to the authorized party.
    pub fn client(&self) -> Option<&str> {
        self.client_id.as_deref().or(self.azp.as_deref())
    }

    pub fn user_name(&self) -> Option<&str> {
        self.username
            .as_deref()
            .or(self.preferred_username.as_deref())
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.exp
            .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok())
    }
}

/// Decodes the payload segment of a compact JWT.
///
/// Returns `None` for opaque credentials or malformed payloads.
pub fn decode_unverified(token: &str) -> Option<JwtClaims> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_claims() {
        let token = encode_unsigned(&json!({
            "exp": 1_700_000_000,
            "iat": 1_699_990_000,
            "sub": "user-1",
            "scope": "openid profile",
            "azp": "web-app",
            "preferred_username": "alice"
        }));

        let claims = decode_unverified(&token).unwrap();
        assert_eq!(claims.exp, Some(1_700_000_000));
        assert_eq!(claims.sub.as_deref(), Some("user-1"));
        assert_eq!(claims.client(), Some("web-app"));
        assert_eq!(claims.user_name(), Some("alice"));
        assert_eq!(
            claims.expires_at().unwrap().unix_timestamp(),
            1_700_000_000
        );
    }

    #[test]
    fn test_opaque_and_malformed_tokens() {
        assert!(decode_unverified("opaque-token").is_none());
        assert!(decode_unverified("a.b").is_none());
        assert!(decode_unverified("a.b.c.d").is_none());
        assert!(decode_unverified("a.!!!.c").is_none());

        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode("hello"));
        assert!(decode_unverified(&not_json).is_none());
    }

    #[test]
    fn test_missing_claims_are_none() {
        let claims = decode_unverified(&encode_unsigned(&json!({}))).unwrap();
        assert_eq!(claims, JwtClaims::default());
        assert!(claims.expires_at().is_none());
    }
}
