//! User Store
//!
//! Cache-aside access to per-user documents. Unlike tenant configs there is
//! no default overlay and no change feed: a missing user is simply `None`
//! and is not cached, and updates republish the returned post-image.

use crate::collection::DocumentCollection;
use crate::config::StoreConfig;
use crate::tenant_store::with_deadline;
use rainbot_core::{
    DocumentKey, RainbotResult, StorageError, UpdateError, UpdateSpec, UserDocument, UserId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

fn into_user(document: Value) -> RainbotResult<UserDocument> {
    UserDocument::try_new(document).map_err(|e| {
        StorageError::InvalidDocument {
            reason: e.to_string(),
        }
        .into()
    })
}

/// Cached access to per-user documents.
pub struct UserStore {
    collection: Arc<dyn DocumentCollection>,
    cache: RwLock<HashMap<UserId, UserDocument>>,
    operation_timeout: Duration,
}

impl UserStore {
    pub fn new(collection: Arc<dyn DocumentCollection>, config: &StoreConfig) -> Self {
        Self::with_timeout(collection, config.operation_timeout)
    }

    pub fn with_timeout(collection: Arc<dyn DocumentCollection>, operation_timeout: Duration) -> Self {
        Self {
            collection,
            cache: RwLock::new(HashMap::new()),
            operation_timeout,
        }
    }

    /// The user's document, or `None` if nothing was ever stored for them.
    pub async fn get_user(&self, user_id: UserId) -> RainbotResult<Option<UserDocument>> {
        if let Some(user) = self.cache.read().await.get(&user_id) {
            return Ok(Some(user.clone()));
        }

        let found = with_deadline(
            "get_user",
            self.operation_timeout,
            self.collection.find_one(&user_id.as_key()),
        )
        .await?;
        let Some(document) = found else {
            return Ok(None);
        };

        let user = into_user(document)?;
        // A concurrent update may have cached a newer post-image meanwhile.
        let mut cache = self.cache.write().await;
        Ok(Some(cache.entry(user_id).or_insert(user).clone()))
    }

    /// Apply `update` to the user's document (creating it if absent) and
    /// return the result.
    pub async fn update_user(
        &self,
        user_id: UserId,
        update: &UpdateSpec,
    ) -> RainbotResult<UserDocument> {
        if update.is_empty() {
            return Err(UpdateError::Malformed {
                reason: "update has no operations".to_string(),
            }
            .into());
        }

        let document = with_deadline(
            "update_user",
            self.operation_timeout,
            self.collection
                .find_one_and_update(&user_id.as_key(), update),
        )
        .await?;
        let user = into_user(document)?;
        self.cache.write().await.insert(user_id, user.clone());

        tracing::debug!(user_id = %user_id, fields = ?update.fields(), "Updated user document");
        Ok(user)
    }

    /// Number of cached user documents.
    pub async fn cached_users(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::InMemoryCollection;
    use serde_json::json;

    fn store() -> (UserStore, Arc<InMemoryCollection>) {
        let collection = Arc::new(InMemoryCollection::users());
        let store = UserStore::with_timeout(collection.clone(), Duration::from_secs(2));
        (store, collection)
    }

    #[tokio::test]
    async fn test_unknown_user_is_none_and_not_cached() {
        let (store, collection) = store();
        assert!(store.get_user(UserId::new(9)).await.unwrap().is_none());
        assert!(store.get_user(UserId::new(9)).await.unwrap().is_none());
        assert_eq!(store.cached_users().await, 0);
        assert_eq!(collection.operation_counts("9").finds, 2);
        assert_eq!(collection.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_existing_user_cached_after_first_read() {
        let (store, collection) = store();
        collection
            .insert_one(json!({"user_id": "5", "warns": 2}))
            .await
            .unwrap();

        let user = store.get_user(UserId::new(5)).await.unwrap().unwrap();
        assert_eq!(user.get("warns"), Some(&json!(2)));
        assert_eq!(user.get("prefix"), None);

        store.get_user(UserId::new(5)).await.unwrap();
        assert_eq!(collection.operation_counts("5").finds, 1);
    }

    #[tokio::test]
    async fn test_update_creates_and_caches() {
        let (store, collection) = store();
        let user = store
            .update_user(UserId::new(8), &UpdateSpec::new().push("notes", "first"))
            .await
            .unwrap();
        assert_eq!(user.user_id(), Some(UserId::new(8)));
        assert_eq!(user.get("notes"), Some(&json!(["first"])));

        let read = store.get_user(UserId::new(8)).await.unwrap().unwrap();
        assert_eq!(read, user);
        assert_eq!(collection.operation_counts("8").finds, 0);
    }

    #[tokio::test]
    async fn test_outage_surfaces_store_unavailable() {
        let (store, collection) = store();
        collection.set_available(false);
        let err = store.get_user(UserId::new(1)).await.unwrap_err();
        assert!(err.is_store_unavailable());
    }
}
