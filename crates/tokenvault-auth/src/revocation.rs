//! Credential and session revocation.
//!
//! Revoking a credential writes a [`RevocationRecord`] at `revoked:{hash}`
//! for the retention window and flags the credential's metadata. The
//! record is what [`RevocationService::is_revoked`] checks, so the check
//! stays a single `exists` call on the hot path.

use std::time::Duration;

use tokenvault_storage::{DynKvStore, KvStoreExt};

use crate::AuthResult;
use crate::audit::{AuditContext, AuditService};
use crate::clock::DynClock;
use crate::crypto::hash_token;
use crate::keys;
use crate::session::SessionStore;
use crate::token::MetadataStore;
use crate::types::{RevocationRecord, RotationState, Session, TokenKind};

/// Revokes credentials and sessions.
#[derive(Clone)]
pub struct RevocationService {
    store: DynKvStore,
    clock: DynClock,
    sessions: SessionStore,
    metadata: MetadataStore,
    audit: AuditService,
    retention: Duration,
}

impl RevocationService {
    pub fn new(
        store: DynKvStore,
        clock: DynClock,
        sessions: SessionStore,
        audit: AuditService,
        retention: Duration,
    ) -> Self {
        Self {
            metadata: MetadataStore::new(store.clone()),
            store,
            clock,
            sessions,
            audit,
            retention,
        }
    }

    /// Revokes one credential.
    ///
    /// With `cascade`, every credential of the owning session is revoked
    /// too and the session is ended.
    pub async fn revoke_token(
        &self,
        token: &str,
        hint: Option<TokenKind>,
        reason: &str,
        cascade: bool,
    ) -> AuthResult<RevocationRecord> {
        let token_hash = hash_token(token);
        let (record, session_id) = self.revoke_hash(&token_hash, hint, reason, cascade).await?;

        if cascade && let Some(session_id) = session_id {
            self.end_session(&session_id, reason, Some(&token_hash))
                .await?;
        }
        Ok(record)
    }

    /// Revokes the access and refresh credentials of a session without
    /// ending it. Returns how many credentials were revoked.
    pub async fn revoke_session_tokens(&self, session_id: &str, reason: &str) -> AuthResult<usize> {
        let Some(session) = self.sessions.load(session_id).await? else {
            return Ok(0);
        };
        self.revoke_credentials_of(&session, reason, None).await
    }

    /// Revokes a session's credentials and marks it revoked.
    ///
    /// Returns `false` if the session does not exist.
    pub async fn revoke_session(&self, session_id: &str, reason: &str) -> AuthResult<bool> {
        self.end_session(session_id, reason, None).await
    }

    /// Ends every session of the user except `except`. Returns the count.
    pub async fn revoke_user_tokens(
        &self,
        user_id: &str,
        except: Option<&str>,
        reason: &str,
    ) -> AuthResult<usize> {
        let (sessions, _) = self.sessions.load_for_user(user_id).await?;
        let mut revoked = 0;
        for session in sessions {
            if Some(session.id.as_str()) == except {
                continue;
            }
            if self.end_session(&session.id, reason, None).await? {
                revoked += 1;
            }
        }
        tracing::info!(user_id, revoked, "Revoked user sessions");
        Ok(revoked)
    }

    /// Fast check by credential hash.
    pub async fn is_revoked(&self, token_hash: &str) -> AuthResult<bool> {
        Ok(self.store.exists(&keys::revoked(token_hash)).await?)
    }

    /// Same as [`Self::is_revoked`] for a raw credential.
    pub async fn is_token_revoked(&self, token: &str) -> AuthResult<bool> {
        self.is_revoked(&hash_token(token)).await
    }

    pub async fn get_revocation(&self, token_hash: &str) -> AuthResult<Option<RevocationRecord>> {
        Ok(self.store.get_json(&keys::revoked(token_hash)).await?)
    }

    async fn revoke_hash(
        &self,
        token_hash: &str,
        hint: Option<TokenKind>,
        reason: &str,
        cascade: bool,
    ) -> AuthResult<(RevocationRecord, Option<String>)> {
        let now = self.clock.now();
        let metadata = self
            .metadata
            .mark_revoked(token_hash, hint, reason, now)
            .await?;

        let kind = metadata.as_ref().map(|m| m.kind).or(hint);
        let record = RevocationRecord::new(token_hash, kind, reason, now);
        self.store
            .set_json(&keys::revoked(token_hash), &record, Some(self.retention))
            .await?;

        let user_id = metadata.as_ref().map(|m| m.user_id.as_str());
        let session_id = metadata.as_ref().map(|m| m.session_id.clone());
        let context = AuditContext::new(user_id, session_id.as_deref());
        self.audit
            .log_token_revoked(&context, token_hash, kind, reason, cascade)
            .await;

        tracing::debug!(token_hash = &token_hash[..16.min(token_hash.len())], ?kind, "Credential revoked");
        Ok((record, session_id))
    }

    async fn revoke_credentials_of(
        &self,
        session: &Session,
        reason: &str,
        skip_hash: Option<&str>,
    ) -> AuthResult<usize> {
        let mut credentials = vec![(hash_token(&session.access_token), TokenKind::Access)];
        if let Some(refresh) = &session.refresh_token {
            credentials.push((hash_token(refresh), TokenKind::Refresh));
        }

        let mut revoked = 0;
        for (token_hash, kind) in credentials {
            if Some(token_hash.as_str()) == skip_hash {
                continue;
            }
            self.revoke_hash(&token_hash, Some(kind), reason, false)
                .await?;
            revoked += 1;
        }
        Ok(revoked)
    }

    /// Revokes the refresh credentials tracked by `rotation:{session}`, the
    /// one still inside its grace period included, then drops the state.
    async fn retire_rotation(
        &self,
        session_id: &str,
        reason: &str,
        skip_hash: Option<&str>,
    ) -> AuthResult<()> {
        let key = keys::rotation(session_id);
        let Some(state) = self.store.get_json::<RotationState>(&key).await? else {
            return Ok(());
        };
        for token_hash in std::iter::once(state.current).chain(state.previous) {
            if Some(token_hash.as_str()) == skip_hash || self.is_revoked(&token_hash).await? {
                continue;
            }
            self.revoke_hash(&token_hash, Some(TokenKind::Refresh), reason, false)
                .await?;
        }
        self.store.delete(&key).await?;
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &str,
        reason: &str,
        skip_hash: Option<&str>,
    ) -> AuthResult<bool> {
        let Some(mut session) = self.sessions.load(session_id).await? else {
            return Ok(false);
        };

        self.revoke_credentials_of(&session, reason, skip_hash)
            .await?;
        self.retire_rotation(session_id, reason, skip_hash).await?;

        let now = self.clock.now();
        if session.active {
            session.revoke(now, reason);
            self.sessions.save(&session, now).await?;
            self.audit.log_session_terminated(&session, reason).await;
        }
        self.sessions.unindex(&session.user_id, &session.id).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::AuditConfig;
    use crate::types::{CredentialMetadata, CredentialPair};
    use tokenvault_storage::{InMemoryKvStore, KvStore};

    struct Fixture {
        service: RevocationService,
        sessions: SessionStore,
        metadata: MetadataStore,
        store: Arc<InMemoryKvStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let sessions = SessionStore::new(store.clone(), Duration::from_secs(86_400));
        let audit = AuditService::new(store.clone(), clock.clone(), AuditConfig::default());
        let service = RevocationService::new(
            store.clone(),
            clock.clone(),
            sessions.clone(),
            audit,
            Duration::from_secs(7 * 86_400),
        );
        Fixture {
            service,
            sessions,
            metadata: MetadataStore::new(store.clone()),
            store,
            clock,
        }
    }

    async fn seed_session(f: &Fixture, user: &str, access: &str, refresh: &str) -> Session {
        let now = f.clock.now();
        let pair = CredentialPair::new(access, 3600, now).with_refresh_token(refresh, Some(86_400));
        let session = Session::new(user, &pair, now);
        f.sessions.save(&session, now).await.unwrap();
        f.sessions.index(user, &session.id).await.unwrap();
        for (token, kind, expires) in [
            (access, TokenKind::Access, pair.access_expires_at()),
            (refresh, TokenKind::Refresh, now + time::Duration::days(1)),
        ] {
            let meta = CredentialMetadata::issue(token, kind, user, &session.id, now, Some(expires));
            f.metadata.save(&meta, now).await.unwrap();
        }
        session
    }

    #[tokio::test]
    async fn test_revoke_then_is_revoked() {
        let f = fixture();
        seed_session(&f, "u1", "at-1", "rt-1").await;

        assert!(!f.service.is_token_revoked("rt-1").await.unwrap());
        let record = f
            .service
            .revoke_token("rt-1", Some(TokenKind::Refresh), "user_logout", false)
            .await
            .unwrap();

        assert_eq!(record.kind, Some(TokenKind::Refresh));
        assert!(f.service.is_token_revoked("rt-1").await.unwrap());
        assert!(!f.service.is_token_revoked("at-1").await.unwrap());

        let meta = f
            .metadata
            .load(TokenKind::Refresh, &hash_token("rt-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(meta.revoked);

        let ttl = f.store.ttl(&keys::revoked(&hash_token("rt-1"))).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(6 * 86_400));
    }

    #[tokio::test]
    async fn test_revoke_unknown_token_still_records() {
        let f = fixture();
        let record = f
            .service
            .revoke_token("never-seen", None, "admin", true)
            .await
            .unwrap();
        assert_eq!(record.kind, None);
        assert!(f.service.is_token_revoked("never-seen").await.unwrap());
        assert_eq!(
            f.service
                .get_revocation(&hash_token("never-seen"))
                .await
                .unwrap()
                .unwrap()
                .reason,
            "admin"
        );
    }

    #[tokio::test]
    async fn test_cascade_ends_owning_session() {
        let f = fixture();
        let session = seed_session(&f, "u1", "at-1", "rt-1").await;

        f.service
            .revoke_token("at-1", Some(TokenKind::Access), "compromised", true)
            .await
            .unwrap();

        assert!(f.service.is_token_revoked("rt-1").await.unwrap());
        let stored = f.sessions.load(&session.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.revocation_reason.as_deref(), Some("compromised"));
        assert!(f.sessions.session_ids("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_session_tokens_keeps_session() {
        let f = fixture();
        let session = seed_session(&f, "u1", "at-1", "rt-1").await;

        let count = f
            .service
            .revoke_session_tokens(&session.id, "rotate_keys")
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(f.service.is_token_revoked("at-1").await.unwrap());
        assert!(f.sessions.load(&session.id).await.unwrap().unwrap().active);
        assert_eq!(f.service.revoke_session_tokens("missing", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_user_tokens_with_exception() {
        let f = fixture();
        let keep = seed_session(&f, "u1", "at-1", "rt-1").await;
        seed_session(&f, "u1", "at-2", "rt-2").await;
        seed_session(&f, "u1", "at-3", "rt-3").await;
        seed_session(&f, "u2", "at-4", "rt-4").await;

        let revoked = f
            .service
            .revoke_user_tokens("u1", Some(&keep.id), "password_change")
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        assert!(!f.service.is_token_revoked("rt-1").await.unwrap());
        assert!(f.service.is_token_revoked("rt-2").await.unwrap());
        assert!(f.service.is_token_revoked("rt-3").await.unwrap());
        assert!(!f.service.is_token_revoked("rt-4").await.unwrap());
        assert_eq!(f.sessions.session_ids("u1").await.unwrap(), vec![keep.id]);
    }

    #[tokio::test]
    async fn test_revocation_is_audited_as_warning() {
        let f = fixture();
        seed_session(&f, "u1", "at-1", "rt-1").await;
        f.service
            .revoke_token("rt-1", None, "logout", false)
            .await
            .unwrap();

        let events = f.store.scan("audit:event:*").await.unwrap();
        assert_eq!(events.len(), 1);
        let value = f.store.get(&events[0]).await.unwrap().unwrap();
        assert_eq!(value["kind"], "token_revoked");
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["userId"], "u1");
    }
}
