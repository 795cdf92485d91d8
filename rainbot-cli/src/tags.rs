//! Per-guild tags
//!
//! Tags live in the `tags` list of a guild config as `{name, value}`
//! entries. Every change is a single update operator, so concurrent writers
//! never lose each other's tags; the duplicate-name check on `create` is a
//! read ahead of the push and two racing creates of the same name can both
//! succeed.

use rainbot_core::{OverlayError, RainbotError, TenantId, UpdateSpec};
use rainbot_storage::TenantConfigs;
use serde_json::json;
use thiserror::Error;

const TAGS_FIELD: &str = "tags";
const MAX_TAG_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("Tag {name:?} already exists")]
    AlreadyExists { name: String },

    #[error("Tag {name:?} not found")]
    NotFound { name: String },

    #[error("Invalid tag name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error(transparent)]
    Store(#[from] RainbotError),
}

impl From<OverlayError> for TagError {
    fn from(err: OverlayError) -> Self {
        Self::Store(err.into())
    }
}

pub type TagResult<T> = Result<T, TagError>;

fn validate_name(name: &str) -> TagResult<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > MAX_TAG_NAME_LEN {
        "longer than 64 bytes"
    } else if name.chars().any(char::is_whitespace) {
        "must not contain whitespace"
    } else {
        return Ok(());
    };
    Err(TagError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Tag operations over any [`TenantConfigs`] implementation.
#[derive(Debug, Clone)]
pub struct TagService<C> {
    configs: C,
}

impl<C: TenantConfigs> TagService<C> {
    pub fn new(configs: C) -> Self {
        Self { configs }
    }

    /// Add a tag; names are unique within a guild.
    pub async fn create(&self, tenant_id: TenantId, name: &str, value: &str) -> TagResult<()> {
        validate_name(name)?;
        let config = self.configs.get_config(tenant_id).await?;
        if config.tags()?.find("name", name).is_ok() {
            return Err(TagError::AlreadyExists {
                name: name.to_string(),
            });
        }

        let update = UpdateSpec::new().push(TAGS_FIELD, json!({ "name": name, "value": value }));
        self.configs.update_config(tenant_id, &update).await?;
        tracing::info!(tenant_id = %tenant_id, tag = name, "Tag created");
        Ok(())
    }

    /// Remove every tag called `name`.
    pub async fn remove(&self, tenant_id: TenantId, name: &str) -> TagResult<()> {
        let config = self.configs.get_config(tenant_id).await?;
        if config.tags()?.find("name", name).is_err() {
            return Err(TagError::NotFound {
                name: name.to_string(),
            });
        }

        let update = UpdateSpec::new().pull(TAGS_FIELD, json!({ "name": name }));
        self.configs.update_config(tenant_id, &update).await?;
        tracing::info!(tenant_id = %tenant_id, tag = name, "Tag removed");
        Ok(())
    }

    /// Tag names in stored order.
    pub async fn list(&self, tenant_id: TenantId) -> TagResult<Vec<String>> {
        let config = self.configs.get_config(tenant_id).await?;
        let tags = config.tags()?;
        Ok(tags
            .iter()
            .filter_map(|tag| tag.get("name").ok()?.as_str().map(str::to_string))
            .collect())
    }

    /// The value stored for `name`.
    pub async fn lookup(&self, tenant_id: TenantId, name: &str) -> TagResult<String> {
        let config = self.configs.get_config(tenant_id).await?;
        let tags = config.tags()?;
        let tag = tags.find("name", name).map_err(|_| TagError::NotFound {
            name: name.to_string(),
        })?;
        Ok(tag
            .get("value")?
            .as_str()
            .map(str::to_string)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rainbot_core::{ConfigView, RainbotResult, StorageError};
    use rainbot_storage::DocumentCollection;
    use rainbot_test_utils::fixtures::{memory_tenant_store, tagged_document};

    #[tokio::test]
    async fn test_create_list_lookup_remove() {
        let (store, _collection) = memory_tenant_store();
        let tags = TagService::new(store.clone());
        let id = TenantId::new(1);

        assert!(tags.list(id).await.unwrap().is_empty());
        tags.create(id, "hello", "Hi there").await.unwrap();
        tags.create(id, "rules", "Be nice.").await.unwrap();

        assert_eq!(tags.list(id).await.unwrap(), vec!["hello", "rules"]);
        assert_eq!(tags.lookup(id, "hello").await.unwrap(), "Hi there");

        tags.remove(id, "hello").await.unwrap();
        assert_eq!(tags.list(id).await.unwrap(), vec!["rules"]);
        assert!(matches!(
            tags.lookup(id, "hello").await,
            Err(TagError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (store, collection) = memory_tenant_store();
        let id = TenantId::new(2);
        collection.insert_one(tagged_document(id)).await.unwrap();
        let tags = TagService::new(store);

        let err = tags.create(id, "faq", "other").await.unwrap_err();
        assert!(matches!(err, TagError::AlreadyExists { ref name } if name == "faq"));
        assert_eq!(tags.lookup(id, "faq").await.unwrap(), "See #faq.");
    }

    #[tokio::test]
    async fn test_remove_missing_tag_is_not_found() {
        let (store, collection) = memory_tenant_store();
        let tags = TagService::new(store);
        let id = TenantId::new(3);

        assert!(matches!(
            tags.remove(id, "ghost").await,
            Err(TagError::NotFound { .. })
        ));
        // The read created the document; nothing was updated.
        assert_eq!(collection.operation_counts("3").updates, 0);
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let (store, _collection) = memory_tenant_store();
        let tags = TagService::new(store);
        let id = TenantId::new(4);

        let long = "x".repeat(65);
        for name in ["", "two words", long.as_str()] {
            assert!(matches!(
                tags.create(id, name, "v").await,
                Err(TagError::InvalidName { .. })
            ));
        }
    }

    struct DownStore;

    #[async_trait]
    impl TenantConfigs for DownStore {
        async fn get_config(&self, _tenant_id: TenantId) -> RainbotResult<ConfigView> {
            Err(StorageError::unavailable("offline").into())
        }

        async fn update_config(
            &self,
            _tenant_id: TenantId,
            _update: &UpdateSpec,
        ) -> RainbotResult<ConfigView> {
            Err(StorageError::unavailable("offline").into())
        }
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let tags = TagService::new(DownStore);
        match tags.list(TenantId::new(5)).await {
            Err(TagError::Store(err)) => assert!(err.is_store_unavailable()),
            other => panic!("Expected store error, got: {:?}", other),
        }
    }
}
