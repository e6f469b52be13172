use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use tokenvault_auth::{
    AuditService, AuthConfig, AuthState, DynClock, GlobalRateLimiter, HttpTokenExchanger,
    MetadataStore, RateLimiter, RevocationService, SessionManager, SessionStore, SystemClock,
    TokenIntrospector, TokenRefreshService, token::DynTokenExchanger,
};
use tokenvault_postgres::PostgresKvStore;
use tokenvault_redis::RedisKvStore;
use tokenvault_storage::{BackendKind, DynKvStore, StorageConfig, create_memory_store};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;

// =============================================================================
// Wiring
// =============================================================================

/// Opens the configured key-value provider.
///
/// The PostgreSQL provider creates its tables on first connect.
pub async fn connect_store(config: &StorageConfig) -> anyhow::Result<DynKvStore> {
    let url = config.url.as_deref().unwrap_or_default();
    let store: DynKvStore = match config.backend {
        BackendKind::Memory => create_memory_store(),
        BackendKind::Redis => Arc::new(
            RedisKvStore::connect(url)
                .await
                .context("failed to connect to redis")?,
        ),
        BackendKind::Postgres => {
            let store = PostgresKvStore::connect(url)
                .await
                .context("failed to connect to postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to create key-value schema")?;
            Arc::new(store)
        }
    };
    tracing::info!(backend = store.backend_name(), "Key-value store ready");
    Ok(store)
}

/// Builds every service on top of one store and one clock.
pub fn build_state(
    store: DynKvStore,
    clock: DynClock,
    config: &AuthConfig,
) -> anyhow::Result<AuthState> {
    let audit = AuditService::new(store.clone(), clock.clone(), config.audit.clone());
    let sessions = SessionStore::new(store.clone(), config.sessions.absolute_timeout);
    let revocation = RevocationService::new(
        store.clone(),
        clock.clone(),
        sessions.clone(),
        audit.clone(),
        config.revocation.retention,
    );

    let exchanger: DynTokenExchanger = Arc::new(
        HttpTokenExchanger::new(&config.upstream, clock.clone())
            .context("failed to build upstream token exchanger")?,
    );

    let refresh = TokenRefreshService::new(
        store.clone(),
        clock.clone(),
        config.tokens.clone(),
        exchanger,
        revocation.clone(),
        sessions.clone(),
        audit.clone(),
    )
    .with_rate_limiter(RateLimiter::new(store.clone(), config.rate_limiting.clone()));

    let manager = SessionManager::new(
        clock.clone(),
        config.sessions.clone(),
        sessions,
        MetadataStore::new(store.clone()),
        refresh.clone(),
        revocation.clone(),
        audit,
    );

    let introspector =
        TokenIntrospector::new(clock.clone(), revocation.clone(), MetadataStore::new(store.clone()));
    let global_limiter =
        GlobalRateLimiter::new(store, clock, config.rate_limiting.global_max_per_second);

    Ok(AuthState::new(
        refresh,
        manager,
        revocation,
        introspector,
        global_limiter,
    ))
}

/// Token router wrapped in request tracing and a body limit.
pub fn build_app(state: AuthState, body_limit: usize) -> Router {
    tokenvault_auth::router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri().path(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record("http.status_code", res.status().as_u16());
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Sweeps expired entries on a fixed interval for the life of the process.
pub fn spawn_purge_task(store: DynKvStore, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Purged expired entries"),
                Err(e) => tracing::warn!(error = %e, "Expired entry sweep failed"),
            }
        }
    })
}

// =============================================================================
// Server
// =============================================================================

pub struct TokenVaultServer {
    addr: SocketAddr,
    app: Router,
    store: DynKvStore,
    purge_interval: Duration,
}

impl TokenVaultServer {
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let store = connect_store(&config.storage).await?;
        let clock: DynClock = Arc::new(SystemClock);
        let state = build_state(store.clone(), clock, &config.auth)?;

        Ok(Self {
            addr: config.addr(),
            app: build_app(state, config.server.body_limit_bytes),
            store,
            purge_interval: config.server.purge_interval,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let purge = spawn_purge_task(self.store, self.purge_interval);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        purge.abort();
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn auth_config() -> AuthConfig {
        let mut config = AuthConfig::default();
        config.upstream.token_endpoint = Some("http://127.0.0.1:9/oauth/token".to_string());
        config
    }

    async fn app() -> Router {
        let store = connect_store(&StorageConfig::default()).await.unwrap();
        let state = build_state(store, Arc::new(SystemClock), &auth_config()).unwrap();
        build_app(state, 64 * 1024)
    }

    #[tokio::test]
    async fn test_memory_store_selected_by_default() {
        let store = connect_store(&StorageConfig::default()).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_build_state_requires_upstream_endpoint() {
        let store = create_memory_store();
        let result = build_state(store, Arc::new(SystemClock), &AuthConfig::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_healthz_through_layers() {
        let response = app()
            .await
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_unknown_token_introspects_inactive() {
        let response = app()
            .await
            .oneshot(
                Request::post("/auth/token/introspect")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "token": "nope" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["active"], false);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let store = create_memory_store();
        let state = build_state(store, Arc::new(SystemClock), &auth_config()).unwrap();
        let app = build_app(state, 32);

        let response = app
            .oneshot(
                Request::post("/auth/token/introspect")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "token": "x".repeat(256) }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
