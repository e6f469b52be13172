//! Token refresh with rotation.
//!
//! A refresh runs these steps:
//!
//! 1. Rate limit check on `token_refresh` (when a limiter is attached)
//! 2. Revocation check on the presented refresh credential
//! 3. Rotation check against the session's [`RotationState`]
//! 4. Upstream exchange
//! 5. Rotation of the refresh credential
//! 6. Metadata persistence and audit
//!
//! With `atomic_rotation`, steps 3 to 5 run under `lock:rotation:{session}`.

use time::OffsetDateTime;
use tokenvault_storage::{DynKvStore, KvStoreExt};

use crate::audit::{AuditContext, AuditService};
use crate::clock::{DynClock, to_std_duration, to_time_duration};
use crate::config::TokenConfig;
use crate::crypto::{generate_token, hash_token, token_fingerprint};
use crate::keys;
use crate::rate_limit::RateLimiter;
use crate::revocation::RevocationService;
use crate::session::SessionStore;
use crate::token::exchange::DynTokenExchanger;
use crate::token::jwt;
use crate::token::metadata::MetadataStore;
use crate::types::{CredentialMetadata, CredentialPair, RotationState, TokenKind};
use crate::{AuthError, AuthResult};

/// Rate limit operation name for refreshes.
pub const REFRESH_OPERATION: &str = "token_refresh";

/// Input to [`TokenRefreshService::refresh`].
#[derive(Clone, Default)]
pub struct RefreshRequest {
    pub refresh_token: String,
    pub session_id: Option<String>,
    /// Access credential being replaced, for the audit trail.
    pub previous_access_token: Option<String>,
    pub force_rotation: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RefreshRequest {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn previous_access_token(mut self, token: impl Into<String>) -> Self {
        self.previous_access_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn force_rotation(mut self) -> Self {
        self.force_rotation = true;
        self
    }

    #[must_use]
    pub fn client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    fn rate_limit_identifier(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| token_fingerprint(&self.refresh_token))
    }
}

impl std::fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("refresh_token", &"[REDACTED]")
            .field("session_id", &self.session_id)
            .field("force_rotation", &self.force_rotation)
            .finish_non_exhaustive()
    }
}

/// Result of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub credentials: CredentialPair,
    pub rotated: bool,
    /// Rotation counter of the session, when it is tracked.
    pub rotation_count: Option<u64>,
}

/// Who a refresh credential belongs to.
struct Owner {
    user_id: String,
    session_id: String,
    client_id: Option<String>,
}

/// Exchanges refresh credentials and rotates them.
#[derive(Clone)]
pub struct TokenRefreshService {
    store: DynKvStore,
    clock: DynClock,
    config: TokenConfig,
    exchanger: DynTokenExchanger,
    revocation: RevocationService,
    sessions: SessionStore,
    metadata: MetadataStore,
    audit: AuditService,
    rate_limiter: Option<RateLimiter>,
}

impl TokenRefreshService {
    pub fn new(
        store: DynKvStore,
        clock: DynClock,
        config: TokenConfig,
        exchanger: DynTokenExchanger,
        revocation: RevocationService,
        sessions: SessionStore,
        audit: AuditService,
    ) -> Self {
        Self {
            metadata: MetadataStore::new(store.clone()),
            store,
            clock,
            config,
            exchanger,
            revocation,
            sessions,
            audit,
            rate_limiter: None,
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Exchanges a refresh credential for a new pair.
    ///
    /// # Errors
    ///
    /// - `RateLimited` when the caller is over its limit or in backoff
    /// - `InvalidCredential` for revoked, rotated-out or rejected credentials
    /// - `UpstreamExchange` when the identity provider is unavailable
    pub async fn refresh(&self, request: RefreshRequest) -> AuthResult<RefreshOutcome> {
        let identifier = request.rate_limit_identifier();

        if let Some(limiter) = &self.rate_limiter {
            let decision = limiter.check(REFRESH_OPERATION, &identifier).await?;
            if let Some(retry_after) = decision.retry_after.filter(|_| !decision.allowed) {
                self.audit
                    .log_rate_limit_exceeded(REFRESH_OPERATION, &identifier, retry_after)
                    .await;
                return Err(AuthError::rate_limited(retry_after));
            }
        }

        match self.refresh_inner(&request).await {
            Ok(outcome) => {
                if let Some(limiter) = &self.rate_limiter
                    && let Err(e) = limiter.record_success(REFRESH_OPERATION, &identifier).await
                {
                    tracing::warn!(error = %e, "Failed to clear refresh backoff");
                }
                Ok(outcome)
            }
            Err(err) => {
                if let Some(limiter) = &self.rate_limiter
                    && let Err(e) = limiter.record_failure(REFRESH_OPERATION, &identifier).await
                {
                    tracing::warn!(error = %e, "Failed to record refresh failure");
                }
                tracing::info!(
                    session_id = request.session_id.as_deref().unwrap_or("-"),
                    category = %err.category(),
                    error = %err,
                    "Token refresh failed"
                );
                let context = AuditContext::new(None, request.session_id.as_deref())
                    .client(request.ip_address.clone(), request.user_agent.clone());
                self.audit
                    .log_refresh_failed(
                        &context,
                        token_fingerprint(&request.refresh_token),
                        &err.to_string(),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn refresh_inner(&self, request: &RefreshRequest) -> AuthResult<RefreshOutcome> {
        let old_hash = hash_token(&request.refresh_token);

        if self.revocation.is_revoked(&old_hash).await? {
            return Err(AuthError::invalid_credential("refresh credential has been revoked"));
        }
        let old_metadata = self.metadata.load(TokenKind::Refresh, &old_hash).await?;
        if old_metadata.as_ref().is_some_and(|m| m.revoked) {
            return Err(AuthError::invalid_credential("refresh credential has been revoked"));
        }

        // Callers may omit the session; the credential's own session still
        // governs rotation.
        let session_id = request
            .session_id
            .clone()
            .or_else(|| old_metadata.as_ref().map(|m| m.session_id.clone()));

        let (credentials, rotated, rotation) =
            match (session_id.as_deref(), self.config.atomic_rotation) {
                (Some(session_id), true) => self.exchange_locked(session_id, request).await?,
                (session_id, _) => self.exchange_and_rotate(session_id, request).await?,
            };

        let now = self.clock.now();
        let owner = self.resolve_owner(session_id.as_deref(), old_metadata).await?;
        if let Some(owner) = &owner {
            self.persist_metadata(owner, &credentials, &request.refresh_token, now)
                .await?;
        }
        self.metadata
            .touch(TokenKind::Refresh, &old_hash, now)
            .await?;

        let session_id = session_id.as_deref();
        let context = AuditContext::new(owner.as_ref().map(|o| o.user_id.as_str()), session_id)
            .client(request.ip_address.clone(), request.user_agent.clone());
        self.audit
            .log_token_refreshed(
                &context,
                request.previous_access_token.as_deref().map(hash_token),
                hash_token(&credentials.access_token),
                rotated,
            )
            .await;
        if rotated {
            let count = rotation.as_ref().map_or(1, |state| state.rotation_count);
            self.audit.log_token_rotated(&context, count).await;
        }

        tracing::debug!(
            session_id = session_id.unwrap_or("-"),
            rotated,
            "Token refreshed"
        );

        Ok(RefreshOutcome {
            credentials,
            rotated,
            rotation_count: rotation.map(|state| state.rotation_count),
        })
    }

    /// Runs the rotation check, exchange and rotation under the session lock.
    async fn exchange_locked(
        &self,
        session_id: &str,
        request: &RefreshRequest,
    ) -> AuthResult<(CredentialPair, bool, Option<RotationState>)> {
        let lock_name = keys::rotation_lock(session_id);
        let ttl = self.config.rotation_lock_ttl;
        let Some(lock) = self.store.lock_acquire(&lock_name, ttl, Some(ttl)).await? else {
            return Err(AuthError::storage(format!(
                "timed out waiting for rotation lock of session {session_id}"
            )));
        };

        let result = self.exchange_and_rotate(Some(session_id), request).await;

        match self.store.lock_release(&lock_name, &lock).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(session_id, "Rotation lock expired before release"),
            Err(e) => tracing::warn!(session_id, error = %e, "Failed to release rotation lock"),
        }
        result
    }

    async fn exchange_and_rotate(
        &self,
        session_id: Option<&str>,
        request: &RefreshRequest,
    ) -> AuthResult<(CredentialPair, bool, Option<RotationState>)> {
        let now = self.clock.now();
        if let Some(session_id) = session_id {
            self.ensure_session_open(session_id).await?;
        }
        let rotation_key = session_id.map(keys::rotation);

        let mut state: Option<RotationState> = match &rotation_key {
            Some(key) => self.store.get_json(key).await?,
            None => None,
        };
        if let (Some(key), Some(state)) = (&rotation_key, state.as_mut()) {
            if state.prune(now) {
                let ttl = self.store.ttl(key).await?;
                self.store.set_json(key, state, ttl).await?;
            }
            if !state.accepts(&request.refresh_token, now) {
                return Err(AuthError::invalid_credential(
                    "refresh credential has been rotated",
                ));
            }
        }

        let mut credentials = self.exchanger.exchange(&request.refresh_token).await?;

        // The session may have been terminated while the exchange ran.
        if let Some(session_id) = session_id {
            self.ensure_session_open(session_id).await?;
        }

        let rotate = self.config.rotation_enabled || request.force_rotation;
        if !rotate {
            credentials.refresh_token = Some(request.refresh_token.clone());
            return Ok((credentials, false, state));
        }

        let next = match credentials.refresh_token.take() {
            Some(issued) if issued != request.refresh_token => issued,
            _ => generate_token(),
        };
        if credentials.refresh_expires_in.is_none() {
            credentials.refresh_expires_in = Some(self.config.refresh_token_lifetime.as_secs());
        }

        if let Some(key) = &rotation_key {
            let mut rotated = state.take().unwrap_or_else(|| {
                RotationState::new(&request.refresh_token, self.config.grace_period, now)
            });
            rotated.rotate(&next, now);
            self.store
                .set_json(key, &rotated, Some(self.config.refresh_token_lifetime))
                .await?;
            state = Some(rotated);
        }

        credentials.refresh_token = Some(next);
        Ok((credentials, true, state))
    }

    /// Credentials of a terminated session are never exchanged.
    async fn ensure_session_open(&self, session_id: &str) -> AuthResult<()> {
        match self.sessions.load(session_id).await? {
            Some(session) if session.is_revoked() => Err(AuthError::invalid_credential(
                "session of the refresh credential has been terminated",
            )),
            _ => Ok(()),
        }
    }

    async fn resolve_owner(
        &self,
        session_id: Option<&str>,
        old_metadata: Option<CredentialMetadata>,
    ) -> AuthResult<Option<Owner>> {
        if let Some(metadata) = old_metadata {
            return Ok(Some(Owner {
                user_id: metadata.user_id,
                session_id: metadata.session_id,
                client_id: metadata.client_id,
            }));
        }
        if let Some(session_id) = session_id
            && let Some(session) = self.sessions.load(session_id).await?
        {
            return Ok(Some(Owner {
                user_id: session.user_id,
                session_id: session.id,
                client_id: None,
            }));
        }
        Ok(None)
    }

    async fn persist_metadata(
        &self,
        owner: &Owner,
        credentials: &CredentialPair,
        presented_refresh: &str,
        now: OffsetDateTime,
    ) -> AuthResult<()> {
        let access = CredentialMetadata::issue(
            &credentials.access_token,
            TokenKind::Access,
            &owner.user_id,
            &owner.session_id,
            now,
            Some(credentials.access_expires_at()),
        )
        .with_client_id(owner.client_id.clone());
        self.metadata.save(&access, now).await?;

        if let Some(refresh) = &credentials.refresh_token
            && refresh != presented_refresh
        {
            let expires_at = credentials.refresh_expires_at().unwrap_or_else(|| {
                now + to_time_duration(self.config.refresh_token_lifetime)
            });
            let metadata = CredentialMetadata::issue(
                refresh,
                TokenKind::Refresh,
                &owner.user_id,
                &owner.session_id,
                now,
                Some(expires_at),
            )
            .with_client_id(owner.client_id.clone());
            self.metadata.save(&metadata, now).await?;
        }
        Ok(())
    }

    /// Returns `true` if the access credential is inside the refresh buffer.
    ///
    /// The expiry comes from the JWT `exp` claim, or `fallback_expiry` for
    /// opaque credentials. Unknown expiry never triggers a refresh.
    pub fn needs_refresh(&self, access_token: &str, fallback_expiry: Option<OffsetDateTime>) -> bool {
        let expires_at = jwt::decode_unverified(access_token)
            .and_then(|claims| claims.expires_at())
            .or(fallback_expiry);
        let Some(expires_at) = expires_at else {
            return false;
        };
        let remaining = expires_at - self.clock.now();
        to_std_duration(remaining) < self.config.refresh_buffer
    }

    /// Refreshes only when the access credential is about to expire.
    ///
    /// Failures are logged and reported as `None`.
    pub async fn refresh_if_needed(
        &self,
        access_token: &str,
        fallback_expiry: Option<OffsetDateTime>,
        request: RefreshRequest,
    ) -> Option<RefreshOutcome> {
        if !self.needs_refresh(access_token, fallback_expiry) {
            return None;
        }
        let request = RefreshRequest {
            previous_access_token: Some(access_token.to_string()),
            ..request
        };
        match self.refresh(request).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "Proactive token refresh failed");
                None
            }
        }
    }
}
