//! `POST /auth/token/introspect`

use axum::{Json, extract::State};

use crate::http::AuthState;
use crate::token::{IntrospectionRequest, IntrospectionResponse};
use crate::{AuthError, AuthResult};

/// Returns `{"active": false}` for anything that is not a live credential.
pub async fn introspect_handler(
    State(state): State<AuthState>,
    Json(request): Json<IntrospectionRequest>,
) -> AuthResult<Json<IntrospectionResponse>> {
    state.check_global_limit().await?;

    if request.token.is_empty() {
        return Err(AuthError::invalid_request("Missing required 'token' parameter"));
    }

    let response = state.introspector.introspect(&request).await?;
    tracing::debug!(active = response.active, "Token introspection completed");
    Ok(Json(response))
}
