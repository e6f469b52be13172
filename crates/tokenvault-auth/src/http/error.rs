//! OAuth-style error responses for `AuthError`.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::AuthError;

impl AuthError {
    /// HTTP status the error maps to.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredential { .. } | Self::SessionInvalid { .. } => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamExchange { .. } => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Storage { .. } | Self::Configuration { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn description(&self) -> String {
        match self {
            Self::InvalidCredential { message }
            | Self::InvalidRequest { message }
            | Self::UpstreamExchange { message } => message.clone(),
            Self::SessionInvalid { reason } => reason.clone(),
            Self::RateLimited { retry_after } => {
                format!("too many attempts, retry after {}s", retry_after.as_secs())
            }
            // Infrastructure details stay in the logs.
            Self::Storage { .. } | Self::Configuration { .. } | Self::Internal { .. } => {
                "internal server error".to_string()
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = self.oauth_error_code();
        let description = self.description();

        if status.is_server_error() {
            tracing::error!(category = %self.category(), error = %self, "Request failed");
        } else {
            tracing::debug!(category = %self.category(), error = %self, "Request rejected");
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

        if let Some(retry_after) = self.retry_after() {
            // Round up so clients never retry early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }

        if status == StatusCode::UNAUTHORIZED {
            let www_auth = build_www_authenticate_header(error, &description);
            if let Ok(value) = HeaderValue::from_str(&www_auth) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }

        let body = json!({
            "error": error,
            "error_description": description,
        });
        (status, headers, Json(body)).into_response()
    }
}

/// `Bearer realm="tokenvault", error="...", error_description="..."`
fn build_www_authenticate_header(error: &str, description: &str) -> String {
    let escaped_desc = description.replace('"', "\\\"");
    format!("Bearer realm=\"tokenvault\", error=\"{error}\", error_description=\"{escaped_desc}\"")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_credential_is_401_with_oauth_body() {
        let response = AuthError::invalid_credential("refresh credential has been revoked").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let www_auth = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(www_auth.contains("realm=\"tokenvault\""));
        assert!(www_auth.contains("error=\"invalid_grant\""));

        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_grant");
        assert_eq!(json["error_description"], "refresh credential has been revoked");
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = AuthError::rate_limited(Duration::from_millis(2500)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
        assert!(!response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(body_json(response).await["error"], "slow_down");
    }

    #[tokio::test]
    async fn test_server_errors_hide_details() {
        let response = AuthError::storage("connection refused to 10.0.0.5").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "server_error");
        assert_eq!(json["error_description"], "internal server error");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AuthError::session_invalid("idle timeout").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::upstream_exchange("timeout").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AuthError::invalid_request("missing token").status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_www_authenticate_header_escaping() {
        let header = build_www_authenticate_header("invalid_token", "Token contains \"quotes\"");
        assert!(header.contains("\\\"quotes\\\""));
    }
}
