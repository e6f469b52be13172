//! Credential metadata persistence.

use std::time::Duration;

use time::OffsetDateTime;
use tokenvault_storage::{DynKvStore, KvStoreExt};

use crate::AuthResult;
use crate::clock::to_std_duration;
use crate::keys;
use crate::types::{CredentialMetadata, TokenKind};

const LOOKUP_ORDER: [TokenKind; 3] = [TokenKind::Refresh, TokenKind::Access, TokenKind::Id];

/// Reads and writes `token:{kind}:{hash}` records.
#[derive(Clone)]
pub struct MetadataStore {
    store: DynKvStore,
}

impl MetadataStore {
    pub fn new(store: DynKvStore) -> Self {
        Self { store }
    }

    /// Saves metadata for its remaining lifetime.
    ///
    /// Metadata for an already expired credential is not written.
    pub async fn save(&self, metadata: &CredentialMetadata, now: OffsetDateTime) -> AuthResult<()> {
        let ttl = match metadata.remaining(now) {
            Some(remaining) if remaining.is_positive() => Some(to_std_duration(remaining)),
            Some(_) => return Ok(()),
            None => None,
        };
        self.store
            .set_json(
                &keys::token_metadata(metadata.kind, &metadata.token_hash),
                metadata,
                ttl,
            )
            .await?;
        Ok(())
    }

    pub async fn load(&self, kind: TokenKind, token_hash: &str) -> AuthResult<Option<CredentialMetadata>> {
        Ok(self
            .store
            .get_json(&keys::token_metadata(kind, token_hash))
            .await?)
    }

    /// Looks up by the hinted kind first, then the others.
    pub async fn find(
        &self,
        token_hash: &str,
        hint: Option<TokenKind>,
    ) -> AuthResult<Option<CredentialMetadata>> {
        if let Some(kind) = hint
            && let Some(found) = self.load(kind, token_hash).await?
        {
            return Ok(Some(found));
        }
        for kind in LOOKUP_ORDER {
            if Some(kind) == hint {
                continue;
            }
            if let Some(found) = self.load(kind, token_hash).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Records one use of the credential, if its metadata is still around.
    pub async fn touch(&self, kind: TokenKind, token_hash: &str, now: OffsetDateTime) -> AuthResult<()> {
        let key = keys::token_metadata(kind, token_hash);
        let Some(mut metadata) = self.store.get_json::<CredentialMetadata>(&key).await? else {
            return Ok(());
        };
        metadata.touch(now);
        // Keep whatever expiry the record already has.
        let ttl = self.store.ttl(&key).await?;
        self.store.set_json(&key, &metadata, ttl).await?;
        Ok(())
    }

    /// Marks metadata revoked, keeping its TTL. Returns the updated record.
    pub async fn mark_revoked(
        &self,
        token_hash: &str,
        hint: Option<TokenKind>,
        reason: &str,
        now: OffsetDateTime,
    ) -> AuthResult<Option<CredentialMetadata>> {
        let Some(mut metadata) = self.find(token_hash, hint).await? else {
            return Ok(None);
        };
        if !metadata.revoked {
            metadata.mark_revoked(now, reason);
            let key = keys::token_metadata(metadata.kind, token_hash);
            let ttl: Option<Duration> = self.store.ttl(&key).await?;
            self.store.set_json(&key, &metadata, ttl).await?;
        }
        Ok(Some(metadata))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::hash_token;
    use tokenvault_storage::{InMemoryKvStore, KvStore};

    fn setup() -> (MetadataStore, Arc<InMemoryKvStore>) {
        let store = Arc::new(InMemoryKvStore::new());
        (MetadataStore::new(store.clone()), store)
    }

    fn metadata(kind: TokenKind, now: OffsetDateTime) -> CredentialMetadata {
        CredentialMetadata::issue(
            "raw",
            kind,
            "u1",
            "s1",
            now,
            Some(now + time::Duration::minutes(10)),
        )
    }

    #[tokio::test]
    async fn test_save_sets_remaining_ttl() {
        let (metadata_store, store) = setup();
        let now = OffsetDateTime::now_utc();
        metadata_store.save(&metadata(TokenKind::Access, now), now).await.unwrap();

        let key = keys::token_metadata(TokenKind::Access, &hash_token("raw"));
        let ttl = store.ttl(&key).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(600) && ttl > Duration::from_secs(590));
    }

    #[tokio::test]
    async fn test_expired_metadata_is_skipped() {
        let (metadata_store, store) = setup();
        let now = OffsetDateTime::now_utc();
        let meta = metadata(TokenKind::Access, now);
        metadata_store
            .save(&meta, now + time::Duration::hours(1))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_find_falls_back_to_other_kind() {
        let (metadata_store, _) = setup();
        let now = OffsetDateTime::now_utc();
        metadata_store.save(&metadata(TokenKind::Refresh, now), now).await.unwrap();

        let found = metadata_store
            .find(&hash_token("raw"), Some(TokenKind::Access))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.kind, TokenKind::Refresh);
        assert!(metadata_store.find("nope", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_and_mark_revoked() {
        let (metadata_store, _) = setup();
        let now = OffsetDateTime::now_utc();
        metadata_store.save(&metadata(TokenKind::Refresh, now), now).await.unwrap();

        let hash = hash_token("raw");
        metadata_store.touch(TokenKind::Refresh, &hash, now).await.unwrap();
        metadata_store.touch(TokenKind::Refresh, &hash, now).await.unwrap();

        let revoked = metadata_store
            .mark_revoked(&hash, None, "logout", now)
            .await
            .unwrap()
            .unwrap();
        assert!(revoked.revoked);
        assert_eq!(revoked.use_count, 2);

        let stored = metadata_store.load(TokenKind::Refresh, &hash).await.unwrap().unwrap();
        assert!(stored.revoked);
    }
}
