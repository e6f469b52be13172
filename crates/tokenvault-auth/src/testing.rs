//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokenvault_storage::{InMemoryKvStore, KvStore};

use crate::audit::AuditService;
use crate::clock::{Clock, DynClock, ManualClock};
use crate::config::AuthConfig;
use crate::rate_limit::RateLimiter;
use crate::revocation::RevocationService;
use crate::session::{SessionManager, SessionStore};
use crate::token::{
    DynTokenExchanger, ExchangeError, MetadataStore, TokenExchanger, TokenRefreshService,
};
use crate::types::{CredentialMetadata, CredentialPair, Session, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeMode {
    /// Issue `at-{n}` / `rt-{n}` for the n-th call.
    Rotate,
    /// Echo the presented refresh credential back.
    SameRefresh,
    Reject,
    Fail,
}

pub(crate) struct ScriptedExchanger {
    clock: DynClock,
    mode: Mutex<ExchangeMode>,
    calls: AtomicUsize,
}

impl ScriptedExchanger {
    pub(crate) fn new(clock: DynClock) -> Self {
        Self {
            clock,
            mode: Mutex::new(ExchangeMode::Rotate),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_mode(&self, mode: ExchangeMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchanger for ScriptedExchanger {
    async fn exchange(&self, refresh_token: &str) -> Result<CredentialPair, ExchangeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = *self.mode.lock().unwrap();
        let now = self.clock.now();
        match mode {
            ExchangeMode::Rotate => Ok(CredentialPair::new(format!("at-{n}"), 3600, now)
                .with_refresh_token(format!("rt-{n}"), Some(86_400))),
            ExchangeMode::SameRefresh => Ok(CredentialPair::new(format!("at-{n}"), 3600, now)
                .with_refresh_token(refresh_token, Some(86_400))),
            ExchangeMode::Reject => Err(ExchangeError::Rejected {
                message: "invalid_grant".to_string(),
            }),
            ExchangeMode::Fail => Err(ExchangeError::Transport {
                message: "connection refused".to_string(),
            }),
        }
    }
}

/// Every service wired to one in-memory store and a manual clock.
pub(crate) struct Harness {
    pub store: Arc<InMemoryKvStore>,
    pub clock: Arc<ManualClock>,
    pub config: AuthConfig,
    pub exchanger: Arc<ScriptedExchanger>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub(crate) fn with_config(customize: impl FnOnce(&mut AuthConfig)) -> Self {
        let mut config = AuthConfig::default();
        customize(&mut config);
        let clock = Arc::new(ManualClock::starting_now());
        Self {
            store: Arc::new(InMemoryKvStore::new()),
            exchanger: Arc::new(ScriptedExchanger::new(clock.clone())),
            clock,
            config,
        }
    }

    pub(crate) fn audit(&self) -> AuditService {
        AuditService::new(self.store.clone(), self.clock.clone(), self.config.audit.clone())
    }

    pub(crate) fn sessions(&self) -> SessionStore {
        SessionStore::new(self.store.clone(), self.config.sessions.absolute_timeout)
    }

    pub(crate) fn metadata(&self) -> MetadataStore {
        MetadataStore::new(self.store.clone())
    }

    pub(crate) fn revocation(&self) -> RevocationService {
        RevocationService::new(
            self.store.clone(),
            self.clock.clone(),
            self.sessions(),
            self.audit(),
            self.config.revocation.retention,
        )
    }

    pub(crate) fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.store.clone(), self.config.rate_limiting.clone())
    }

    pub(crate) fn refresh_service(&self) -> TokenRefreshService {
        self.refresh_service_with(self.exchanger.clone())
    }

    /// Refresh service backed by `exchanger` instead of the scripted one.
    pub(crate) fn refresh_service_with(&self, exchanger: DynTokenExchanger) -> TokenRefreshService {
        TokenRefreshService::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.tokens.clone(),
            exchanger,
            self.revocation(),
            self.sessions(),
            self.audit(),
        )
    }

    pub(crate) fn session_manager(&self) -> SessionManager {
        self.session_manager_with(self.exchanger.clone())
    }

    pub(crate) fn session_manager_with(&self, exchanger: DynTokenExchanger) -> SessionManager {
        SessionManager::new(
            self.clock.clone(),
            self.config.sessions.clone(),
            self.sessions(),
            self.metadata(),
            self.refresh_service_with(exchanger),
            self.revocation(),
            self.audit(),
        )
    }

    /// Persists an active session holding `at-0` and `refresh_token`.
    pub(crate) async fn seed_session(&self, user_id: &str, refresh_token: &str) -> Session {
        let now = self.clock.now();
        let pair =
            CredentialPair::new("at-0", 3600, now).with_refresh_token(refresh_token, Some(86_400));
        let session = Session::new(user_id, &pair, now);

        let sessions = self.sessions();
        sessions.save(&session, now).await.unwrap();
        sessions.index(user_id, &session.id).await.unwrap();

        let metadata = self.metadata();
        for (token, kind, expires_at) in [
            ("at-0", TokenKind::Access, pair.access_expires_at()),
            (refresh_token, TokenKind::Refresh, now + time::Duration::days(1)),
        ] {
            let record =
                CredentialMetadata::issue(token, kind, user_id, &session.id, now, Some(expires_at));
            metadata.save(&record, now).await.unwrap();
        }
        session
    }

    /// Kinds of every stored audit event.
    pub(crate) async fn audit_kinds(&self) -> Vec<String> {
        let keys = self.store.scan("audit:event:*").await.unwrap();
        let values = self.store.mget(&keys).await.unwrap();
        values
            .into_iter()
            .flatten()
            .filter_map(|v| v["kind"].as_str().map(str::to_string))
            .collect()
    }
}
