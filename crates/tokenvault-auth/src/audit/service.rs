//! Audit service: persists events on the key-value backend.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokenvault_storage::DynKvStore;

use crate::AuthResult;
use crate::audit::event::{AuditContext, AuditDetails, AuditEvent, AuditEventKind, Severity};
use crate::clock::{DynClock, to_time_duration};
use crate::config::AuditConfig;
use crate::device::{DeviceChange, DeviceDescriptor};
use crate::keys;
use crate::types::{Session, TokenKind};

/// Filter for [`AuditService::get_events`].
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Empty means every kind.
    pub kinds: Vec<AuditEventKind>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn between(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = AuditEventKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(user) = &self.user_id
            && event.user_id.as_ref() != Some(user)
        {
            return false;
        }
        if let Some(session) = &self.session_id
            && event.session_id.as_ref() != Some(session)
        {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if self.start.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        true
    }
}

/// Event counts over a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub total: u64,
    pub by_kind: BTreeMap<AuditEventKind, u64>,
    pub by_severity: BTreeMap<Severity, u64>,
}

/// Records and queries security events.
///
/// Writes are best-effort: a storage failure is logged and never surfaced
/// to the operation that triggered the event.
#[derive(Clone)]
pub struct AuditService {
    store: DynKvStore,
    clock: DynClock,
    config: AuditConfig,
}

impl AuditService {
    pub fn new(store: DynKvStore, clock: DynClock, config: AuditConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Starts an event stamped with the service clock.
    pub fn event(&self, kind: AuditEventKind, details: AuditDetails) -> AuditEvent {
        AuditEvent::new(kind, details, self.clock.now())
    }

    /// Logs and stores an event. Never fails.
    pub async fn log_event(&self, event: AuditEvent) {
        emit_trace(&event);

        if !self.config.enabled {
            return;
        }

        if let Err(e) = self.store_event(&event).await {
            tracing::error!(
                error = %e,
                audit_id = %event.id,
                kind = %event.kind,
                "Failed to store audit event"
            );
        }
    }

    async fn store_event(&self, event: &AuditEvent) -> AuthResult<()> {
        let id = event.id.to_string();
        let id_value = Value::String(id.clone());

        let mut entries = vec![
            (keys::audit_event(&id), serde_json::to_value(event).map_err(|e| {
                crate::AuthError::internal(format!("failed to encode audit event: {e}"))
            })?),
            (keys::audit_date(event.timestamp, &id), id_value.clone()),
        ];
        if let Some(user) = &event.user_id {
            entries.push((keys::audit_user(user, event.timestamp, &id), id_value.clone()));
        }
        if let Some(session) = &event.session_id {
            entries.push((keys::audit_session(session, event.timestamp, &id), id_value));
        }

        self.store.mset(entries, Some(self.config.retention)).await?;
        Ok(())
    }

    // =========================================================================
    // Convenience wrappers
    // =========================================================================

    pub async fn log_session_created(&self, session: &Session, evicted_sessions: usize) {
        let event = self
            .event(
                AuditEventKind::SessionCreated,
                AuditDetails::SessionCreated {
                    device: session.device.as_ref().map(DeviceDescriptor::display_name),
                    evicted_sessions,
                },
            )
            .user(&session.user_id)
            .session(&session.id)
            .ip_address(session.ip_address.clone())
            .user_agent(session.device.as_ref().map(|d| d.user_agent.clone()));
        self.log_event(event).await;
    }

    pub async fn log_session_terminated(&self, session: &Session, reason: &str) {
        let event = self
            .event(
                AuditEventKind::SessionTerminated,
                AuditDetails::SessionTerminated {
                    reason: reason.to_string(),
                },
            )
            .user(&session.user_id)
            .session(&session.id);
        self.log_event(event).await;
    }

    pub async fn log_token_refreshed(
        &self,
        context: &AuditContext,
        old_token_hash: Option<String>,
        new_token_hash: String,
        rotated: bool,
    ) {
        let event = self.event(
            AuditEventKind::TokenRefreshed,
            AuditDetails::TokenRefreshed {
                old_token_hash,
                new_token_hash,
                rotated,
            },
        );
        self.log_event(context.apply(event)).await;
    }

    pub async fn log_token_rotated(&self, context: &AuditContext, rotation_count: u64) {
        let event = self.event(
            AuditEventKind::TokenRotated,
            AuditDetails::TokenRotated { rotation_count },
        );
        self.log_event(context.apply(event)).await;
    }

    pub async fn log_refresh_failed(
        &self,
        context: &AuditContext,
        token_fingerprint: String,
        error: &str,
    ) {
        let event = self.event(
            AuditEventKind::TokenRefreshFailed,
            AuditDetails::TokenRefreshFailed {
                token_fingerprint,
                error: error.to_string(),
            },
        );
        self.log_event(context.apply(event)).await;
    }

    pub async fn log_token_revoked(
        &self,
        context: &AuditContext,
        token_hash: &str,
        kind: Option<TokenKind>,
        reason: &str,
        cascade: bool,
    ) {
        let event = self
            .event(
                AuditEventKind::TokenRevoked,
                AuditDetails::TokenRevoked {
                    token_hash: token_hash.to_string(),
                    kind,
                    reason: reason.to_string(),
                    cascade,
                },
            )
            .severity(Severity::Warning);
        self.log_event(context.apply(event)).await;
    }

    pub async fn log_rate_limit_exceeded(
        &self,
        operation: &str,
        identifier: &str,
        retry_after: Duration,
    ) {
        let event = self.event(
            AuditEventKind::RateLimitExceeded,
            AuditDetails::RateLimitExceeded {
                operation: operation.to_string(),
                identifier: identifier.to_string(),
                retry_after_secs: retry_after.as_secs(),
            },
        );
        self.log_event(event).await;
    }

    pub async fn log_device_mismatch(
        &self,
        session: &Session,
        presented: &DeviceDescriptor,
        changes: Vec<DeviceChange>,
        suspicious: bool,
    ) {
        let expected = session
            .device
            .as_ref()
            .map(DeviceDescriptor::display_name)
            .unwrap_or_default();
        let event = if suspicious {
            self.event(
                AuditEventKind::SuspiciousActivity,
                AuditDetails::SuspiciousActivity {
                    description: format!(
                        "device changed from {expected} to {} ({changes:?})",
                        presented.display_name()
                    ),
                },
            )
        } else {
            self.event(
                AuditEventKind::DeviceMismatch,
                AuditDetails::DeviceMismatch {
                    expected,
                    presented: presented.display_name(),
                    changes,
                },
            )
        };
        let event = event
            .user(&session.user_id)
            .session(&session.id)
            .user_agent(Some(presented.user_agent.clone()));
        self.log_event(event).await;
    }

    pub async fn log_ip_mismatch(&self, session: &Session, presented: &str) {
        let event = self
            .event(
                AuditEventKind::IpMismatch,
                AuditDetails::IpMismatch {
                    expected: session.ip_address.clone(),
                    presented: presented.to_string(),
                },
            )
            .user(&session.user_id)
            .session(&session.id)
            .ip_address(Some(presented.to_string()));
        self.log_event(event).await;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns matching events, newest first.
    pub async fn get_events(&self, query: &AuditQuery) -> AuthResult<Vec<AuditEvent>> {
        let index_keys = self.candidate_keys(query).await?;

        let mut event_keys: Vec<String> = index_keys
            .iter()
            .filter_map(|key| key.rsplit(':').next())
            .map(keys::audit_event)
            .collect();
        event_keys.sort();
        event_keys.dedup();

        let values = self.store.mget(&event_keys).await?;
        let mut events: Vec<AuditEvent> = values
            .into_iter()
            .flatten()
            .filter_map(|value| match serde_json::from_value::<AuditEvent>(value) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable audit event");
                    None
                }
            })
            .filter(|event| query.matches(event))
            .collect();

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Scans the most selective index for the query.
    async fn candidate_keys(&self, query: &AuditQuery) -> AuthResult<Vec<String>> {
        if let Some(user) = &query.user_id {
            return Ok(self.store.scan(&format!("audit:user:{user}:*")).await?);
        }
        if let Some(session) = &query.session_id {
            return Ok(self.store.scan(&format!("audit:session:{session}:*")).await?);
        }
        if let (Some(start), Some(end)) = (query.start, query.end) {
            // Nothing older than the retention window can still exist.
            let oldest = self.clock.now() - to_time_duration(self.config.retention);
            let mut day = start.max(oldest).to_offset(time::UtcOffset::UTC).date();
            let last = end.to_offset(time::UtcOffset::UTC).date();

            let mut keys = Vec::new();
            while day <= last {
                let stamp = keys::day_stamp(day.midnight().assume_utc());
                keys.extend(self.store.scan(&format!("audit:date:{stamp}:*")).await?);
                match day.next_day() {
                    Some(next) => day = next,
                    None => break,
                }
            }
            return Ok(keys);
        }
        Ok(self.store.scan("audit:event:*").await?)
    }

    /// Counts events between `start` and `end` by kind and severity.
    pub async fn get_event_stats(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> AuthResult<AuditStats> {
        let events = self.get_events(&AuditQuery::between(start, end)).await?;

        let mut stats = AuditStats::default();
        for event in events {
            stats.total += 1;
            *stats.by_kind.entry(event.kind).or_default() += 1;
            *stats.by_severity.entry(event.severity).or_default() += 1;
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for AuditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditService")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish()
    }
}

fn emit_trace(event: &AuditEvent) {
    let user = event.user_id.as_deref().unwrap_or("-");
    let session = event.session_id.as_deref().unwrap_or("-");
    match event.severity {
        Severity::Info => tracing::info!(
            target: "tokenvault::audit",
            audit_id = %event.id,
            kind = %event.kind,
            user_id = user,
            session_id = session,
            "audit event"
        ),
        Severity::Warning => tracing::warn!(
            target: "tokenvault::audit",
            audit_id = %event.id,
            kind = %event.kind,
            user_id = user,
            session_id = session,
            "audit event"
        ),
        Severity::Error | Severity::Critical => tracing::error!(
            target: "tokenvault::audit",
            audit_id = %event.id,
            kind = %event.kind,
            severity = %event.severity,
            user_id = user,
            session_id = session,
            "audit event"
        ),
    }
}
