//! `POST /auth/token/refresh`

use axum::{Json, extract::State, http::HeaderMap};
use serde::{Deserialize, Serialize};

use crate::device::{extract_ip_address, extract_user_agent};
use crate::http::AuthState;
use crate::token::{RefreshOutcome, RefreshRequest};
use crate::{AuthError, AuthResult};

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<RefreshOutcome> for RefreshResponse {
    fn from(outcome: RefreshOutcome) -> Self {
        let credentials = outcome.credentials;
        Self {
            access_token: credentials.access_token,
            refresh_token: credentials.refresh_token,
            expires_in: credentials.expires_in,
            token_type: credentials.token_type,
            scope: credentials.scope,
        }
    }
}

/// Exchanges a refresh credential.
///
/// With a `session_id`, the session's stored credentials are replaced too.
pub async fn refresh_handler(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Json(body): Json<RefreshBody>,
) -> AuthResult<Json<RefreshResponse>> {
    state.check_global_limit().await?;

    if body.refresh_token.is_empty() {
        return Err(AuthError::invalid_request("Missing required 'refresh_token' parameter"));
    }

    let outcome = match body.session_id.as_deref() {
        Some(session_id) => {
            state
                .sessions
                .refresh_session(session_id, Some(&body.refresh_token))
                .await?
        }
        None => {
            let request = RefreshRequest::new(body.refresh_token)
                .client(extract_ip_address(&headers), extract_user_agent(&headers));
            state.refresh.refresh(request).await?
        }
    };

    tracing::debug!(rotated = outcome.rotated, "Refresh endpoint succeeded");
    Ok(Json(outcome.into()))
}
