//! Tenant Store
//!
//! Owns the config cache and the guild collection. Reads are served from the
//! cache and fall back to the store on a miss, creating the document from the
//! default schema if the tenant has never been seen. Updates go straight to
//! the store as one atomic upsert and publish the returned post-image to the
//! cache, so the caller's next read sees its own write.
//!
//! Two calls (`get_config` then `update_config`) are not a transaction: a
//! change computed from a read can be overtaken by another process writing
//! in between. Express such changes as a single [`UpdateSpec`] instead.

use crate::cache::{CacheHandle, CacheStats, PublishSource};
use crate::change_feed::{ChangeFeedListener, FeedMetricsSnapshot, FeedState};
use crate::collection::DocumentCollection;
use crate::config::{FeedConfig, StoreConfig};
use crate::constants::DEFAULT_CACHE_CHANNEL_CAPACITY;
use async_trait::async_trait;
use rainbot_core::{
    new_tenant_document, ConfigView, DocumentKey, RainbotError, RainbotResult, StorageError,
    TenantId, UpdateError, UpdateSpec,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Per-tenant configuration access, as consumed by command handlers.
#[async_trait]
pub trait TenantConfigs: Send + Sync {
    /// Current config view for `tenant_id`, creating it on first access.
    async fn get_config(&self, tenant_id: TenantId) -> RainbotResult<ConfigView>;

    /// Apply `update` atomically and return the resulting view.
    async fn update_config(
        &self,
        tenant_id: TenantId,
        update: &UpdateSpec,
    ) -> RainbotResult<ConfigView>;
}

/// Run `operation` under a deadline; expiry surfaces as `StoreUnavailable`.
pub(crate) async fn with_deadline<T>(
    operation: &'static str,
    after: Duration,
    future: impl Future<Output = RainbotResult<T>>,
) -> RainbotResult<T> {
    match tokio::time::timeout(after, future).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = after.as_millis() as u64,
                "Store operation timed out"
            );
            Err(StorageError::timed_out(operation, after).into())
        }
    }
}

fn into_view(document: Value) -> RainbotResult<ConfigView> {
    ConfigView::try_new(document).map_err(|e| {
        StorageError::InvalidDocument {
            reason: e.to_string(),
        }
        .into()
    })
}

struct TenantStoreInner {
    collection: Arc<dyn DocumentCollection>,
    cache: CacheHandle,
    operation_timeout: Duration,
    feed_state: Arc<watch::Sender<FeedState>>,
}

/// Cached, change-feed-synchronised access to per-tenant config documents.
#[derive(Clone)]
pub struct TenantStore {
    inner: Arc<TenantStoreInner>,
}

impl TenantStore {
    /// Create a store over `collection`. Must be called inside a Tokio
    /// runtime; the cache actor is spawned immediately.
    pub fn new(collection: Arc<dyn DocumentCollection>, config: &StoreConfig) -> Self {
        Self::with_timeout(collection, config.operation_timeout)
    }

    /// Create a store with an explicit per-operation deadline.
    pub fn with_timeout(collection: Arc<dyn DocumentCollection>, operation_timeout: Duration) -> Self {
        let (feed_state, _) = watch::channel(FeedState::Idle);
        Self {
            inner: Arc::new(TenantStoreInner {
                collection,
                cache: CacheHandle::spawn(DEFAULT_CACHE_CHANNEL_CAPACITY),
                operation_timeout,
                feed_state: Arc::new(feed_state),
            }),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.inner.operation_timeout
    }

    /// Current change feed state.
    pub fn feed_state(&self) -> FeedState {
        *self.inner.feed_state.borrow()
    }

    /// Watch change feed state transitions.
    pub fn subscribe_feed_state(&self) -> watch::Receiver<FeedState> {
        self.inner.feed_state.subscribe()
    }

    pub async fn cache_stats(&self) -> RainbotResult<CacheStats> {
        self.inner.cache.stats().await
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Config for `tenant_id`; see [`TenantConfigs::get_config`].
    pub async fn get_config(&self, tenant_id: TenantId) -> RainbotResult<ConfigView> {
        self.get_config_with_timeout(tenant_id, self.inner.operation_timeout)
            .await
    }

    /// [`TenantStore::get_config`] with an explicit deadline for the remote
    /// part. Cache hits never wait on the store.
    pub async fn get_config_with_timeout(
        &self,
        tenant_id: TenantId,
        timeout: Duration,
    ) -> RainbotResult<ConfigView> {
        if self.feed_state() == FeedState::Failed {
            // Nothing keeps the cache fresh any more.
            tracing::error!(tenant_id = %tenant_id, "Change feed failed; reading through to the store");
            return with_deadline("get_config", timeout, self.fetch_or_create(tenant_id)).await;
        }

        let lookup = self.inner.cache.lookup(tenant_id).await?;
        if let Some(view) = lookup.entry {
            return Ok(view);
        }

        let view = with_deadline("get_config", timeout, self.fetch_or_create(tenant_id)).await?;
        self.inner
            .cache
            .populate(tenant_id, view, lookup.generation)
            .await
    }

    /// Reload `tenant_id` from the store and overwrite the cached entry.
    pub async fn refresh(&self, tenant_id: TenantId) -> RainbotResult<ConfigView> {
        let view = with_deadline(
            "refresh",
            self.inner.operation_timeout,
            self.fetch_or_create(tenant_id),
        )
        .await?;
        self.inner
            .cache
            .publish(tenant_id, view.clone(), PublishSource::Load)
            .await?;
        Ok(view)
    }

    async fn fetch_or_create(&self, tenant_id: TenantId) -> RainbotResult<ConfigView> {
        match self.inner.collection.find_one(&tenant_id.as_key()).await? {
            Some(document) => into_view(document),
            None => self.insert_default(tenant_id).await,
        }
    }

    // ========================================================================
    // CREATION
    // ========================================================================

    /// Create the document for `tenant_id` from the default schema, cache it
    /// and return it. If another caller created it first, the existing
    /// document is returned instead.
    pub async fn create_config(&self, tenant_id: TenantId) -> RainbotResult<ConfigView> {
        let view = with_deadline(
            "create_config",
            self.inner.operation_timeout,
            self.insert_default(tenant_id),
        )
        .await?;
        self.inner
            .cache
            .publish(tenant_id, view.clone(), PublishSource::Load)
            .await?;
        Ok(view)
    }

    async fn insert_default(&self, tenant_id: TenantId) -> RainbotResult<ConfigView> {
        let document = new_tenant_document(tenant_id);
        match self.inner.collection.insert_one(document.clone()).await {
            Ok(()) => {
                tracing::info!(tenant_id = %tenant_id, "Created tenant config from defaults");
                into_view(document)
            }
            Err(RainbotError::Storage(StorageError::DuplicateKey { .. })) => {
                tracing::debug!(tenant_id = %tenant_id, "Tenant config created concurrently; using stored copy");
                match self.inner.collection.find_one(&tenant_id.as_key()).await? {
                    Some(existing) => into_view(existing),
                    None => Err(StorageError::InvalidDocument {
                        reason: format!(
                            "tenant {} reported as duplicate but not found",
                            tenant_id
                        ),
                    }
                    .into()),
                }
            }
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Apply `update`; see [`TenantConfigs::update_config`].
    pub async fn update_config(
        &self,
        tenant_id: TenantId,
        update: &UpdateSpec,
    ) -> RainbotResult<ConfigView> {
        self.update_config_with_timeout(tenant_id, update, self.inner.operation_timeout)
            .await
    }

    /// [`TenantStore::update_config`] with an explicit deadline.
    ///
    /// On expiry the write may still land; the change feed delivers it if so.
    pub async fn update_config_with_timeout(
        &self,
        tenant_id: TenantId,
        update: &UpdateSpec,
        timeout: Duration,
    ) -> RainbotResult<ConfigView> {
        if update.is_empty() {
            return Err(UpdateError::Malformed {
                reason: "update has no operations".to_string(),
            }
            .into());
        }

        let document = with_deadline(
            "update_config",
            timeout,
            self.inner
                .collection
                .find_one_and_update(&tenant_id.as_key(), update),
        )
        .await?;
        let view = into_view(document)?;
        self.inner
            .cache
            .publish(tenant_id, view.clone(), PublishSource::LocalUpdate)
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            fields = ?update.fields(),
            "Updated tenant config"
        );
        Ok(view)
    }

    // ========================================================================
    // CHANGE FEED
    // ========================================================================

    /// Spawn the change feed listener for this store. It runs until
    /// `shutdown` flips to `true` (or its sender is dropped), or until the
    /// failure budget in `config` is exhausted.
    pub fn start_change_feed(
        &self,
        config: FeedConfig,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<RainbotResult<FeedMetricsSnapshot>> {
        let listener = ChangeFeedListener::new(
            Arc::clone(&self.inner.collection),
            self.inner.cache.clone(),
            Arc::clone(&self.inner.feed_state),
            config,
        );
        tokio::spawn(listener.run(shutdown))
    }
}

#[async_trait]
impl TenantConfigs for TenantStore {
    async fn get_config(&self, tenant_id: TenantId) -> RainbotResult<ConfigView> {
        TenantStore::get_config(self, tenant_id).await
    }

    async fn update_config(
        &self,
        tenant_id: TenantId,
        update: &UpdateSpec,
    ) -> RainbotResult<ConfigView> {
        TenantStore::update_config(self, tenant_id, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::InMemoryCollection;
    use serde_json::json;

    fn store() -> (TenantStore, Arc<InMemoryCollection>) {
        let collection = Arc::new(InMemoryCollection::guilds());
        let store = TenantStore::with_timeout(collection.clone(), Duration::from_secs(2));
        (store, collection)
    }

    #[tokio::test]
    async fn test_first_read_creates_default_document() {
        let (store, collection) = store();
        let view = store.get_config(TenantId::new(7)).await.unwrap();
        assert_eq!(view.tenant_id(), Some(TenantId::new(7)));
        assert_eq!(view.prefix().unwrap(), "!!");

        let stored = collection.find_one("7").await.unwrap().unwrap();
        assert_eq!(stored["tenant_id"], json!("7"));
        assert_eq!(collection.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let (store, collection) = store();
        let id = TenantId::new(1);
        let first = store.get_config(id).await.unwrap();
        let second = store.get_config(id).await.unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(collection.operation_counts("1").finds, 1);
    }

    #[tokio::test]
    async fn test_update_is_visible_to_next_read() {
        let (store, _collection) = store();
        let id = TenantId::new(3);
        store.get_config(id).await.unwrap();
        let updated = store
            .update_config(id, &UpdateSpec::new().set("prefix", "?"))
            .await
            .unwrap();
        assert_eq!(updated.prefix().unwrap(), "?");
        assert_eq!(store.get_config(id).await.unwrap().prefix().unwrap(), "?");
    }

    #[tokio::test]
    async fn test_empty_update_rejected() {
        let (store, collection) = store();
        let err = store
            .update_config(TenantId::new(1), &UpdateSpec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RainbotError::Update(UpdateError::Malformed { .. })));
        assert_eq!(collection.operation_counts("1").updates, 0);
    }

    #[tokio::test]
    async fn test_create_config_returns_existing_on_duplicate() {
        let (store, collection) = store();
        collection
            .insert_one(json!({"tenant_id": "4", "prefix": "$"}))
            .await
            .unwrap();
        let view = store.create_config(TenantId::new(4)).await.unwrap();
        assert_eq!(view.prefix().unwrap(), "$");
        assert_eq!(collection.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_out_of_band_write() {
        let (store, collection) = store();
        let id = TenantId::new(2);
        store.get_config(id).await.unwrap();
        collection
            .find_one_and_update("2", &UpdateSpec::new().set("prefix", ">"))
            .await
            .unwrap();
        assert_eq!(store.get_config(id).await.unwrap().prefix().unwrap(), "!!");
        assert_eq!(store.refresh(id).await.unwrap().prefix().unwrap(), ">");
        assert_eq!(store.get_config(id).await.unwrap().prefix().unwrap(), ">");
    }

    #[tokio::test]
    async fn test_outage_surfaces_store_unavailable() {
        let (store, collection) = store();
        collection.set_available(false);
        let err = store.get_config(TenantId::new(1)).await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn test_cache_hit_survives_outage() {
        let (store, collection) = store();
        let id = TenantId::new(1);
        store.get_config(id).await.unwrap();
        collection.set_available(false);
        assert!(store.get_config(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let (store, collection) = store();
        collection.set_latency(Duration::from_millis(500));
        let err = store
            .get_config_with_timeout(TenantId::new(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(err.to_string().contains("timed out"));
    }
}
