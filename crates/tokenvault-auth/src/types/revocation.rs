//! Revocation record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::TokenKind;

/// Marker stored at `revoked:{hash}` for the revocation retention window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationRecord {
    pub token_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub revoked_at: OffsetDateTime,
    pub reason: String,
    /// Kind of the revoked credential, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TokenKind>,
}

impl RevocationRecord {
    pub fn new(
        token_hash: impl Into<String>,
        kind: Option<TokenKind>,
        reason: impl Into<String>,
        revoked_at: OffsetDateTime,
    ) -> Self {
        Self {
            token_hash: token_hash.into(),
            revoked_at,
            reason: reason.into(),
            kind,
        }
    }
}
