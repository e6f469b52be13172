//! Session lifecycle orchestration.
//!
//! # State machine
//!
//! ```text
//! ACTIVE <-> IDLE          (touch brings an idle session back)
//! ACTIVE | IDLE -> EXPIRED | REVOKED
//! ```
//!
//! `EXPIRED` and `REVOKED` are terminal. Validation terminates idle and
//! over-age sessions instead of reviving them.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::audit::AuditService;
use crate::clock::{DynClock, to_time_duration};
use crate::config::SessionConfig;
use crate::device::{DeviceComparison, DeviceDescriptor};
use crate::revocation::RevocationService;
use crate::session::SessionStore;
use crate::token::{MetadataStore, RefreshOutcome, RefreshRequest, TokenRefreshService};
use crate::types::{CredentialMetadata, CredentialPair, Session, SessionStatus, TokenKind};
use crate::{AuthError, AuthResult};

/// Reason recorded when a session is evicted by the per-user limit.
const EVICTION_REASON: &str = "session_limit";

/// Result of a successful [`SessionManager::validate`].
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// The session as persisted after validation.
    pub session: Session,
    /// Set when validation renewed the credentials.
    pub renewed: Option<CredentialPair>,
}

/// Creates, validates and terminates sessions.
#[derive(Clone)]
pub struct SessionManager {
    clock: DynClock,
    config: SessionConfig,
    sessions: SessionStore,
    metadata: MetadataStore,
    refresh: TokenRefreshService,
    revocation: RevocationService,
    audit: AuditService,
}

impl SessionManager {
    pub fn new(
        clock: DynClock,
        config: SessionConfig,
        sessions: SessionStore,
        metadata: MetadataStore,
        refresh: TokenRefreshService,
        revocation: RevocationService,
        audit: AuditService,
    ) -> Self {
        Self {
            clock,
            config,
            sessions,
            metadata,
            refresh,
            revocation,
            audit,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn idle_timeout(&self) -> time::Duration {
        to_time_duration(self.config.idle_timeout)
    }

    fn status(&self, session: &Session, now: OffsetDateTime) -> SessionStatus {
        session.status(now, self.idle_timeout())
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Starts a session for freshly issued credentials.
    ///
    /// When the user is at `max_sessions_per_user`, non-active sessions are
    /// terminated first, then the least recently active ones.
    pub async fn create(
        &self,
        user_id: &str,
        credentials: &CredentialPair,
        device: Option<DeviceDescriptor>,
        ip_address: Option<String>,
        metadata: BTreeMap<String, String>,
    ) -> AuthResult<Session> {
        let evicted = self.enforce_limit(user_id).await?;

        let now = self.clock.now();
        let mut session = Session::new(user_id, credentials, now);
        session.device = device;
        session.ip_address = ip_address;
        session.metadata = metadata;

        self.sessions.save(&session, now).await?;
        self.sessions.index(user_id, &session.id).await?;
        self.persist_credentials(&session, now).await?;
        self.audit.log_session_created(&session, evicted).await;

        let device = session.device.as_ref().map(DeviceDescriptor::display_name);
        tracing::info!(
            user_id,
            session_id = %session.id,
            evicted,
            device = device.as_deref().unwrap_or("-"),
            "Session created"
        );
        Ok(session)
    }

    /// Makes room for one more session. Returns how many were terminated.
    async fn enforce_limit(&self, user_id: &str) -> AuthResult<usize> {
        let max = self.config.max_sessions_per_user;
        if max == 0 {
            return Ok(0);
        }

        let existing = self.live_sessions(user_id).await?;
        if existing.len() < max {
            return Ok(0);
        }

        let now = self.clock.now();
        let mut evicted = 0;

        let (mut active, stale): (Vec<Session>, Vec<Session>) = existing
            .into_iter()
            .partition(|s| self.status(s, now) == SessionStatus::Active);
        for session in stale {
            if self.revocation.revoke_session(&session.id, EVICTION_REASON).await? {
                evicted += 1;
            }
        }

        active.sort_by_key(|s| s.last_activity);
        let mut remaining = active.len();
        for session in active {
            if remaining < max {
                break;
            }
            if self.revocation.revoke_session(&session.id, EVICTION_REASON).await? {
                evicted += 1;
            }
            remaining -= 1;
        }

        tracing::debug!(user_id, evicted, "Session limit enforced");
        Ok(evicted)
    }

    async fn persist_credentials(&self, session: &Session, now: OffsetDateTime) -> AuthResult<()> {
        let access = CredentialMetadata::issue(
            &session.access_token,
            TokenKind::Access,
            &session.user_id,
            &session.id,
            now,
            Some(session.access_expires_at),
        );
        self.metadata.save(&access, now).await?;

        if let Some(refresh) = &session.refresh_token {
            let expires_at = session
                .refresh_expires_at
                .unwrap_or_else(|| session.created_at + to_time_duration(self.config.absolute_timeout));
            let record = CredentialMetadata::issue(
                refresh,
                TokenKind::Refresh,
                &session.user_id,
                &session.id,
                now,
                Some(expires_at),
            );
            self.metadata.save(&record, now).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Loads a session.
    ///
    /// With `validate`, only an active session is returned, and it is touched.
    pub async fn get(&self, session_id: &str, validate: bool) -> AuthResult<Option<Session>> {
        let Some(mut session) = self.sessions.load(session_id).await? else {
            return Ok(None);
        };
        if !validate {
            return Ok(Some(session));
        }

        let now = self.clock.now();
        if self.status(&session, now) != SessionStatus::Active {
            return Ok(None);
        }
        session.touch(now);
        self.sessions.save(&session, now).await?;
        Ok(Some(session))
    }

    /// Records activity. Returns `false` for missing or terminal sessions.
    pub async fn touch(&self, session_id: &str) -> AuthResult<bool> {
        let Some(mut session) = self.sessions.load(session_id).await? else {
            return Ok(false);
        };
        let now = self.clock.now();
        if self.status(&session, now).is_terminal() {
            return Ok(false);
        }
        session.touch(now);
        self.sessions.save(&session, now).await?;
        Ok(true)
    }

    /// The user's sessions, most recently active first.
    ///
    /// Index entries whose session record is gone are pruned.
    pub async fn list_user_sessions(&self, user_id: &str) -> AuthResult<Vec<Session>> {
        let mut sessions = self.live_sessions(user_id).await?;
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    async fn live_sessions(&self, user_id: &str) -> AuthResult<Vec<Session>> {
        let (sessions, dangling) = self.sessions.load_for_user(user_id).await?;
        for session_id in &dangling {
            self.sessions.unindex(user_id, session_id).await?;
        }
        if !dangling.is_empty() {
            tracing::debug!(user_id, pruned = dangling.len(), "Pruned dangling session index entries");
        }
        Ok(sessions)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validates a session presented by a client.
    ///
    /// Idle, over-age and suspicious-device sessions are terminated before
    /// the error is returned. A valid session is touched and, when its access
    /// credential is about to expire, renewed inline.
    ///
    /// # Errors
    ///
    /// `SessionInvalid` with one of: `session not found`, `session revoked`,
    /// `session expired`, `idle timeout`, `absolute timeout`,
    /// `device mismatch`.
    pub async fn validate(
        &self,
        session_id: &str,
        device: Option<&DeviceDescriptor>,
        ip_address: Option<&str>,
    ) -> AuthResult<ValidationOutcome> {
        let Some(session) = self.sessions.load(session_id).await? else {
            return Err(AuthError::session_invalid("session not found"));
        };

        let now = self.clock.now();
        match self.status(&session, now) {
            SessionStatus::Revoked => return Err(AuthError::session_invalid("session revoked")),
            SessionStatus::Expired => return Err(AuthError::session_invalid("session expired")),
            SessionStatus::Idle => return Err(self.fail(&session, "idle timeout").await),
            SessionStatus::Active => {}
        }

        if session.age(now) > to_time_duration(self.config.absolute_timeout) {
            return Err(self.fail(&session, "absolute timeout").await);
        }

        if self.config.device_binding
            && let Some(presented) = device
            && let Some(bound) = &session.device
        {
            match bound.compare(presented) {
                DeviceComparison::Suspicious(changes) => {
                    self.audit
                        .log_device_mismatch(&session, presented, changes, true)
                        .await;
                    return Err(self.fail(&session, "device mismatch").await);
                }
                DeviceComparison::Changed => {
                    self.audit
                        .log_device_mismatch(&session, presented, Vec::new(), false)
                        .await;
                }
                DeviceComparison::Identical | DeviceComparison::TrustedDevice => {}
            }
        }

        if self.config.ip_binding
            && let Some(presented) = ip_address
            && session.ip_address.as_deref().is_some_and(|bound| bound != presented)
        {
            self.audit.log_ip_mismatch(&session, presented).await;
        }

        let mut renewed = None;
        if let Some(refresh_token) = session.refresh_token.clone() {
            let request = RefreshRequest::new(refresh_token)
                .session(&session.id)
                .client(
                    ip_address.map(str::to_string),
                    device.map(|d| d.user_agent.clone()),
                );
            renewed = self
                .refresh
                .refresh_if_needed(&session.access_token, Some(session.access_expires_at), request)
                .await
                .map(|outcome| outcome.credentials);
        }

        // The session may have been terminated while the exchange ran, so the
        // copy loaded above must not be written back.
        let Some(mut session) = self.sessions.load(session_id).await? else {
            return Err(AuthError::session_invalid("session not found"));
        };
        let status = self.status(&session, now);
        if status.is_terminal() {
            return Err(AuthError::session_invalid(format!("session {status}")));
        }
        if let Some(credentials) = &renewed {
            session.apply_credentials(credentials);
        }
        session.touch(now);
        self.sessions.save(&session, now).await?;
        Ok(ValidationOutcome { session, renewed })
    }

    /// Terminates the session and builds the matching error.
    async fn fail(&self, session: &Session, reason: &str) -> AuthError {
        if let Err(e) = self.terminate(&session.id, reason).await {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to terminate session");
        }
        tracing::info!(session_id = %session.id, user_id = %session.user_id, reason, "Session rejected");
        AuthError::session_invalid(reason)
    }

    // =========================================================================
    // Refresh and termination
    // =========================================================================

    /// Refreshes the credentials of a session.
    ///
    /// `refresh_token` defaults to the one stored on the session. The stored
    /// session is only updated after the refresh fully succeeded.
    pub async fn refresh_session(
        &self,
        session_id: &str,
        refresh_token: Option<&str>,
    ) -> AuthResult<RefreshOutcome> {
        let Some(session) = self.sessions.load(session_id).await? else {
            return Err(AuthError::session_invalid("session not found"));
        };
        let status = self.status(&session, self.clock.now());
        if status.is_terminal() {
            return Err(AuthError::session_invalid(format!("session {status}")));
        }

        let refresh_token = match refresh_token {
            Some(token) => token.to_string(),
            None => session
                .refresh_token
                .clone()
                .ok_or_else(|| AuthError::invalid_request("session has no refresh credential"))?,
        };

        let outcome = self
            .refresh
            .refresh(
                RefreshRequest::new(refresh_token)
                    .session(&session.id)
                    .previous_access_token(session.access_token.clone()),
            )
            .await?;

        // The session may have been terminated while the exchange ran.
        let now = self.clock.now();
        let Some(mut session) = self.sessions.load(session_id).await? else {
            return Err(AuthError::session_invalid("session not found"));
        };
        if self.status(&session, now).is_terminal() {
            return Err(AuthError::session_invalid("session revoked"));
        }
        session.apply_credentials(&outcome.credentials);
        session.touch(now);
        self.sessions.save(&session, now).await?;
        Ok(outcome)
    }

    /// Ends a session and revokes its credentials.
    ///
    /// Returns `false` if the session does not exist.
    pub async fn terminate(&self, session_id: &str, reason: &str) -> AuthResult<bool> {
        self.revocation.revoke_session(session_id, reason).await
    }

    /// Ends every session of the user except `except`. Returns the count.
    pub async fn terminate_all_for_user(&self, user_id: &str, except: Option<&str>) -> AuthResult<usize> {
        self.revocation
            .revoke_user_tokens(user_id, except, "all_sessions_terminated")
            .await
    }
}
