//! Session persistence on the key-value backend.

use std::time::Duration;

use time::OffsetDateTime;
use tokenvault_storage::{DynKvStore, KvStoreExt};

use crate::AuthResult;
use crate::clock::to_std_duration;
use crate::keys;
use crate::types::Session;

const MIN_TTL: Duration = Duration::from_secs(1);

/// Reads and writes `session:{id}` records and the `user_sessions:{user}` index.
#[derive(Clone)]
pub struct SessionStore {
    store: DynKvStore,
    absolute_timeout: Duration,
}

impl SessionStore {
    pub fn new(store: DynKvStore, absolute_timeout: Duration) -> Self {
        Self {
            store,
            absolute_timeout,
        }
    }

    pub async fn load(&self, session_id: &str) -> AuthResult<Option<Session>> {
        Ok(self.store.get_json(&keys::session(session_id)).await?)
    }

    /// Persists the session until its absolute lifetime runs out.
    pub async fn save(&self, session: &Session, now: OffsetDateTime) -> AuthResult<()> {
        let remaining = self
            .absolute_timeout
            .saturating_sub(to_std_duration(session.age(now)))
            .max(MIN_TTL);
        self.store
            .set_json(&keys::session(&session.id), session, Some(remaining))
            .await?;
        Ok(())
    }

    pub async fn index(&self, user_id: &str, session_id: &str) -> AuthResult<()> {
        self.store
            .add_to_set(&keys::user_sessions(user_id), session_id)
            .await?;
        Ok(())
    }

    pub async fn unindex(&self, user_id: &str, session_id: &str) -> AuthResult<bool> {
        Ok(self
            .store
            .remove_from_set(&keys::user_sessions(user_id), session_id)
            .await?)
    }

    /// Session ids indexed for the user, sorted.
    pub async fn session_ids(&self, user_id: &str) -> AuthResult<Vec<String>> {
        Ok(self.store.set_members(&keys::user_sessions(user_id)).await?)
    }

    /// Loads every indexed session of the user.
    ///
    /// Index entries whose record is gone are returned in the second list.
    pub async fn load_for_user(&self, user_id: &str) -> AuthResult<(Vec<Session>, Vec<String>)> {
        let ids = self.session_ids(user_id).await?;
        let keys: Vec<String> = ids.iter().map(|id| keys::session(id)).collect();
        let values = self.store.mget(&keys).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        let mut dangling = Vec::new();
        for (id, value) in ids.into_iter().zip(values) {
            match value.map(serde_json::from_value::<Session>) {
                Some(Ok(session)) => sessions.push(session),
                Some(Err(e)) => {
                    tracing::warn!(session_id = %id, error = %e, "Undecodable session record");
                    dangling.push(id);
                }
                None => dangling.push(id),
            }
        }
        Ok((sessions, dangling))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::CredentialPair;
    use tokenvault_storage::{InMemoryKvStore, KvStore};

    fn setup() -> (SessionStore, Arc<InMemoryKvStore>) {
        let store = Arc::new(InMemoryKvStore::new());
        (
            SessionStore::new(store.clone(), Duration::from_secs(24 * 3600)),
            store,
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (sessions, store) = setup();
        let now = OffsetDateTime::now_utc();
        let session = Session::new("u1", &CredentialPair::new("at", 60, now), now);

        sessions.save(&session, now).await.unwrap();
        let loaded = sessions.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        let ttl = store.ttl(&keys::session(&session.id)).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(23 * 3600));
    }

    #[tokio::test]
    async fn test_save_uses_remaining_lifetime() {
        let (sessions, store) = setup();
        let created = OffsetDateTime::now_utc();
        let session = Session::new("u1", &CredentialPair::new("at", 60, created), created);

        sessions
            .save(&session, created + time::Duration::hours(23))
            .await
            .unwrap();
        let ttl = store.ttl(&keys::session(&session.id)).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_load_for_user_reports_dangling() {
        let (sessions, _) = setup();
        let now = OffsetDateTime::now_utc();
        let session = Session::new("u1", &CredentialPair::new("at", 60, now), now);

        sessions.save(&session, now).await.unwrap();
        sessions.index("u1", &session.id).await.unwrap();
        sessions.index("u1", "gone").await.unwrap();

        let (found, dangling) = sessions.load_for_user("u1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(dangling, vec!["gone".to_string()]);

        assert!(sessions.unindex("u1", "gone").await.unwrap());
        assert_eq!(sessions.session_ids("u1").await.unwrap(), vec![session.id]);
    }
}
