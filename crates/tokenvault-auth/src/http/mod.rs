//! HTTP handlers for the token endpoints.
//!
//! # Available Handlers
//!
//! - [`refresh`] - `POST /auth/token/refresh`
//! - [`revoke`] - `POST /auth/token/revoke`
//! - [`introspect`] - `POST /auth/token/introspect`
//!
//! Every token endpoint consults the [`GlobalRateLimiter`] before doing
//! any work.

mod error;
pub mod introspect;
pub mod refresh;
pub mod revoke;

use axum::{
    Json, Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;

use crate::AuthResult;
use crate::rate_limit::GlobalRateLimiter;
use crate::revocation::RevocationService;
use crate::session::SessionManager;
use crate::token::{TokenIntrospector, TokenRefreshService};

pub use introspect::introspect_handler;
pub use refresh::refresh_handler;
pub use revoke::revoke_handler;

// =============================================================================
// State
// =============================================================================

/// Services shared by the token endpoints.
#[derive(Clone)]
pub struct AuthState {
    pub refresh: TokenRefreshService,
    pub sessions: SessionManager,
    pub revocation: RevocationService,
    pub introspector: TokenIntrospector,
    pub global_limiter: GlobalRateLimiter,
}

impl AuthState {
    pub fn new(
        refresh: TokenRefreshService,
        sessions: SessionManager,
        revocation: RevocationService,
        introspector: TokenIntrospector,
        global_limiter: GlobalRateLimiter,
    ) -> Self {
        Self {
            refresh,
            sessions,
            revocation,
            introspector,
            global_limiter,
        }
    }

    pub(crate) async fn check_global_limit(&self) -> AuthResult<()> {
        self.global_limiter.check().await?.into_result()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Builds the token router.
pub fn router(state: AuthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/token/refresh", post(refresh_handler))
        .route("/auth/token/revoke", post(revoke_handler))
        .route("/auth/token/introspect", post(introspect_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ExchangeMode, Harness};
    use crate::token::MetadataStore;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn state(h: &Harness, global_max: u64) -> AuthState {
        AuthState::new(
            h.refresh_service().with_rate_limiter(h.rate_limiter()),
            h.session_manager(),
            h.revocation(),
            TokenIntrospector::new(h.clock.clone(), h.revocation(), MetadataStore::new(h.store.clone())),
            GlobalRateLimiter::new(h.store.clone(), h.clock.clone(), global_max),
        )
    }

    fn app(h: &Harness) -> Router {
        router(state(h, 1000))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let h = Harness::new();
        let response = app(&h)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_refresh_returns_new_pair() {
        let h = Harness::new();
        let response = app(&h)
            .oneshot(post_json("/auth/token/refresh", json!({ "refresh_token": "rt-0" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = read_json(response).await;
        assert_eq!(body["access_token"], "at-1");
        assert_eq!(body["refresh_token"], "rt-1");
        assert_eq!(body["expires_in"], 3600);
        assert_eq!(body["token_type"], "Bearer");
    }

    #[tokio::test]
    async fn test_refresh_with_session_updates_session() {
        let h = Harness::new();
        let session = h.seed_session("u1", "rt-0").await;
        let response = app(&h)
            .oneshot(post_json(
                "/auth/token/refresh",
                json!({ "refresh_token": "rt-0", "session_id": session.id }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = h.sessions().load(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "at-1");
    }

    #[tokio::test]
    async fn test_refresh_error_statuses() {
        let h = Harness::new();
        let app = app(&h);

        h.exchanger.set_mode(ExchangeMode::Reject);
        let response = app
            .clone()
            .oneshot(post_json("/auth/token/refresh", json!({ "refresh_token": "rt-a" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(read_json(response).await["error"], "invalid_grant");

        // The failure armed a backoff for this credential.
        h.exchanger.set_mode(ExchangeMode::Rotate);
        let response = app
            .clone()
            .oneshot(post_json("/auth/token/refresh", json!({ "refresh_token": "rt-a" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        h.exchanger.set_mode(ExchangeMode::Fail);
        let response = app
            .clone()
            .oneshot(post_json("/auth/token/refresh", json!({ "refresh_token": "rt-b" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app
            .oneshot(post_json("/auth/token/refresh", json!({ "refresh_token": "" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_revoke_cascades_and_introspect_reflects_it() {
        let h = Harness::new();
        let session = h.seed_session("u1", "rt-0").await;
        let app = app(&h);

        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/token/introspect",
                json!({ "token": "at-0", "token_type_hint": "access_token" }),
            ))
            .await
            .unwrap();
        let body = read_json(response).await;
        assert_eq!(body["active"], true);
        assert_eq!(body["sub"], "u1");

        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/token/revoke",
                json!({ "token": "rt-0", "token_type_hint": "refresh_token", "reason": "logout" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["revoked_at"].is_string());

        let response = app
            .oneshot(post_json("/auth/token/introspect", json!({ "token": "at-0" })))
            .await
            .unwrap();
        assert_eq!(read_json(response).await, json!({ "active": false }));

        let stored = h.sessions().load(&session.id).await.unwrap().unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn test_global_limit_applies_to_all_endpoints() {
        let h = Harness::new();
        let app = router(state(&h, 1));

        let response = app
            .clone()
            .oneshot(post_json("/auth/token/introspect", json!({ "token": "x" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json("/auth/token/revoke", json!({ "token": "x" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
