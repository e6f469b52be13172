//! `POST /auth/token/revoke`
//!
//! Revocation always cascades to the owning session, so revoking either
//! credential of a pair logs the session out.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::http::AuthState;
use crate::types::TokenKind;
use crate::{AuthError, AuthResult};

const DEFAULT_REASON: &str = "client_revocation";

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub token: String,
    #[serde(default)]
    pub token_type_hint: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub success: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub revoked_at: OffsetDateTime,
}

pub async fn revoke_handler(
    State(state): State<AuthState>,
    Json(body): Json<RevokeBody>,
) -> AuthResult<Json<RevokeResponse>> {
    state.check_global_limit().await?;

    if body.token.is_empty() {
        return Err(AuthError::invalid_request("Missing required 'token' parameter"));
    }

    let hint = body.token_type_hint.as_deref().and_then(TokenKind::from_hint);
    let reason = body
        .reason
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REASON);

    let record = state
        .revocation
        .revoke_token(&body.token, hint, reason, true)
        .await?;

    Ok(Json(RevokeResponse {
        success: true,
        revoked_at: record.revoked_at,
    }))
}
