//! In-process collection backend.
//!
//! Documents live in a `tokio::sync::RwLock<HashMap>`; committed writes are
//! fanned out over a broadcast channel while the write lock is held, so
//! subscribers observe them in commit order. Outages, latency and dropped
//! change streams can be injected for tests.

use super::{document_key, ChangeEvent, ChangeKind, ChangeStream, DocumentCollection};
use crate::constants::DEFAULT_FEED_BUFFER;
use async_trait::async_trait;
use futures_util::StreamExt;
use rainbot_core::{
    RainbotError, RainbotResult, StorageError, UpdateSpec, TENANT_KEY_FIELD, USER_KEY_FIELD,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

/// Per-key operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub finds: u64,
    pub inserts: u64,
    pub updates: u64,
}

impl OperationCounts {
    pub fn total(&self) -> u64 {
        self.finds + self.inserts + self.updates
    }
}

#[derive(Clone, Copy)]
enum Operation {
    Find,
    Insert,
    Update,
}

/// Process-local [`DocumentCollection`].
pub struct InMemoryCollection {
    name: String,
    key_field: String,
    documents: RwLock<HashMap<String, Value>>,
    feed: Mutex<broadcast::Sender<ChangeEvent>>,
    feed_buffer: usize,
    available: AtomicBool,
    latency_ms: AtomicU64,
    counts: Mutex<HashMap<String, OperationCounts>>,
}

impl InMemoryCollection {
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self::with_feed_buffer(name, key_field, DEFAULT_FEED_BUFFER)
    }

    /// Like [`InMemoryCollection::new`] with a custom per-subscriber buffer.
    /// A subscriber that falls further behind sees its stream fail.
    pub fn with_feed_buffer(
        name: impl Into<String>,
        key_field: impl Into<String>,
        feed_buffer: usize,
    ) -> Self {
        let feed_buffer = feed_buffer.max(1);
        let (sender, _) = broadcast::channel(feed_buffer);
        Self {
            name: name.into(),
            key_field: key_field.into(),
            documents: RwLock::new(HashMap::new()),
            feed: Mutex::new(sender),
            feed_buffer,
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Collection keyed like guild config documents.
    pub fn guilds() -> Self {
        Self::new("guilds", TENANT_KEY_FIELD)
    }

    /// Collection keyed like user documents.
    pub fn users() -> Self {
        Self::new("users", USER_KEY_FIELD)
    }

    // ------------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------------

    /// Simulate an outage. While unavailable every operation fails with
    /// `StoreUnavailable`; going down also drops open change streams.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            self.close_feed();
        }
    }

    /// Delay every operation by `latency` before it touches the data.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// End every open change stream. New `watch()` calls still succeed.
    pub fn close_feed(&self) {
        let (sender, _) = broadcast::channel(self.feed_buffer);
        *self.lock_feed() = sender;
    }

    /// Number of currently open change streams.
    pub fn subscriber_count(&self) -> usize {
        self.lock_feed().receiver_count()
    }

    /// Operations issued against `key` so far.
    pub fn operation_counts(&self, key: &str) -> OperationCounts {
        self.lock_counts().get(key).copied().unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lock_feed(&self) -> MutexGuard<'_, broadcast::Sender<ChangeEvent>> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_counts(&self) -> MutexGuard<'_, HashMap<String, OperationCounts>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, key: &str, operation: Operation) {
        let mut counts = self.lock_counts();
        let entry = counts.entry(key.to_string()).or_default();
        match operation {
            Operation::Find => entry.finds += 1,
            Operation::Insert => entry.inserts += 1,
            Operation::Update => entry.updates += 1,
        }
    }

    async fn enter(&self, operation: &'static str) -> RainbotResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(format!(
                "{} unreachable during {}",
                self.name, operation
            ))
            .into());
        }
        Ok(())
    }

    fn publish(&self, kind: ChangeKind, document: Value) {
        // No subscribers is not an error.
        let _ = self.lock_feed().send(ChangeEvent::new(kind, document));
    }
}

#[async_trait]
impl DocumentCollection for InMemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_field(&self) -> &str {
        &self.key_field
    }

    async fn find_one(&self, key: &str) -> RainbotResult<Option<Value>> {
        self.record(key, Operation::Find);
        self.enter("find_one").await?;
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn insert_one(&self, document: Value) -> RainbotResult<()> {
        let key = match document_key(&document, &self.key_field) {
            Some(key) if document.is_object() => key.to_string(),
            _ => {
                return Err(StorageError::InvalidDocument {
                    reason: format!("document has no string {:?} field", self.key_field),
                }
                .into())
            }
        };
        self.record(&key, Operation::Insert);
        self.enter("insert_one").await?;

        let mut documents = self.documents.write().await;
        if documents.contains_key(&key) {
            return Err(StorageError::DuplicateKey { key }.into());
        }
        documents.insert(key, document.clone());
        self.publish(ChangeKind::Insert, document);
        Ok(())
    }

    async fn find_one_and_update(&self, key: &str, update: &UpdateSpec) -> RainbotResult<Value> {
        self.record(key, Operation::Update);
        self.enter("find_one_and_update").await?;

        let mut documents = self.documents.write().await;
        let mut scratch = match documents.get(key) {
            Some(existing) => existing.clone(),
            None => {
                let mut seed = Map::new();
                seed.insert(self.key_field.clone(), Value::String(key.to_string()));
                Value::Object(seed)
            }
        };
        update.apply(&mut scratch, &self.key_field)?;
        documents.insert(key.to_string(), scratch.clone());
        self.publish(ChangeKind::Update, scratch.clone());
        Ok(scratch)
    }

    async fn watch(&self) -> RainbotResult<ChangeStream> {
        self.enter("watch").await?;
        let receiver = self.lock_feed().subscribe();
        let name = self.name.clone();
        let stream = BroadcastStream::new(receiver).map(move |item| {
            item.map_err(|err| {
                RainbotError::from(StorageError::unavailable(format!(
                    "{} change stream: {}",
                    name, err
                )))
            })
        });
        Ok(stream.boxed())
    }

    async fn count(&self) -> RainbotResult<u64> {
        self.enter("count").await?;
        Ok(self.documents.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_then_find() {
        let collection = InMemoryCollection::guilds();
        collection
            .insert_one(json!({"tenant_id": "1", "prefix": "?"}))
            .await
            .unwrap();
        let doc = collection.find_one("1").await.unwrap().unwrap();
        assert_eq!(doc["prefix"], "?");
        assert_eq!(collection.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let collection = InMemoryCollection::guilds();
        collection.insert_one(json!({"tenant_id": "1"})).await.unwrap();
        let err = collection
            .insert_one(json!({"tenant_id": "1"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RainbotError::Storage(StorageError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_insert_without_key_rejected() {
        let collection = InMemoryCollection::guilds();
        let err = collection.insert_one(json!({"prefix": "?"})).await.unwrap_err();
        assert!(matches!(
            err,
            RainbotError::Storage(StorageError::InvalidDocument { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_upserts_seeded_document() {
        let collection = InMemoryCollection::guilds();
        let doc = collection
            .find_one_and_update("9", &UpdateSpec::new().set("prefix", "?"))
            .await
            .unwrap();
        assert_eq!(doc, json!({"tenant_id": "9", "prefix": "?"}));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_document_untouched() {
        let collection = InMemoryCollection::guilds();
        collection
            .insert_one(json!({"tenant_id": "1", "prefix": "?"}))
            .await
            .unwrap();
        let bad = UpdateSpec::new().set("ok", 1).push("prefix", "x");
        assert!(collection.find_one_and_update("1", &bad).await.is_err());
        let doc = collection.find_one("1").await.unwrap().unwrap();
        assert_eq!(doc, json!({"tenant_id": "1", "prefix": "?"}));
    }

    #[tokio::test]
    async fn test_watch_sees_writes_in_order() {
        let collection = InMemoryCollection::guilds();
        let mut stream = collection.watch().await.unwrap();

        collection.insert_one(json!({"tenant_id": "1"})).await.unwrap();
        collection
            .find_one_and_update("1", &UpdateSpec::new().set("prefix", "?"))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.kind, ChangeKind::Insert);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.kind, ChangeKind::Update);
        assert_eq!(second.document["prefix"], "?");
    }

    #[tokio::test]
    async fn test_outage_fails_operations_and_ends_streams() {
        let collection = InMemoryCollection::guilds();
        let mut stream = collection.watch().await.unwrap();
        collection.set_available(false);

        assert!(stream.next().await.is_none());
        let err = collection.find_one("1").await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(collection.watch().await.is_err());

        collection.set_available(true);
        assert!(collection.find_one("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_error() {
        let collection = InMemoryCollection::with_feed_buffer("guilds", "tenant_id", 1);
        let mut stream = collection.watch().await.unwrap();
        for i in 0..3 {
            collection
                .find_one_and_update("1", &UpdateSpec::new().set("n", i))
                .await
                .unwrap();
        }
        let first = stream.next().await.unwrap();
        assert!(first.unwrap_err().is_store_unavailable());
    }

    #[tokio::test]
    async fn test_operation_counts_per_key() {
        let collection = InMemoryCollection::guilds();
        collection.find_one("1").await.unwrap();
        collection.find_one("1").await.unwrap();
        collection
            .find_one_and_update("1", &UpdateSpec::new().set("a", 1))
            .await
            .unwrap();

        let counts = collection.operation_counts("1");
        assert_eq!(counts.finds, 2);
        assert_eq!(counts.updates, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(collection.operation_counts("2"), OperationCounts::default());
    }
}
