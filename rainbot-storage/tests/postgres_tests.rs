//! PostgreSQL backend tests.
//!
//! Run with `cargo test -p rainbot-storage --features db-tests` against a
//! server reachable through the `RAINBOT_DB_*` variables. Each test uses its
//! own table so runs do not interfere.

#![cfg(feature = "db-tests")]

use futures_util::StreamExt;
use rainbot_core::{RainbotError, StorageError, TenantId, UpdateSpec};
use rainbot_storage::{
    ChangeKind, DocumentCollection, FeedConfig, FeedState, PostgresCollection, StoreConfig,
    TenantStore,
};
use rainbot_test_utils::fixtures::eventually;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

static TABLE_SEQ: AtomicU64 = AtomicU64::new(0);

async fn fresh_collection() -> Arc<PostgresCollection> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let table = format!(
        "test_guilds_{}_{}",
        nanos,
        TABLE_SEQ.fetch_add(1, Ordering::SeqCst)
    );
    let config = StoreConfig::from_env().with_tables(table, "test_users_unused");
    let pool = config.create_pool().expect("pool");
    let collection = PostgresCollection::guilds(&config, pool).expect("collection");
    collection.ensure_schema().await.expect("schema");
    Arc::new(collection)
}

#[tokio::test]
async fn test_insert_find_and_duplicate() {
    let collection = fresh_collection().await;
    collection
        .insert_one(json!({"tenant_id": "1", "prefix": "?"}))
        .await
        .unwrap();
    let doc = collection.find_one("1").await.unwrap().unwrap();
    assert_eq!(doc["prefix"], "?");

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
async fn test_upsert_applies_operators_atomically() {
    let collection = fresh_collection().await;
    let doc = collection
        .find_one_and_update(
            "2",
            &UpdateSpec::new()
                .set("logs.member_join", "9")
                .push("tags", json!({"name": "a", "value": "1"})),
        )
        .await
        .unwrap();
    assert_eq!(doc["tenant_id"], "2");
    assert_eq!(doc["logs"]["member_join"], "9");

    let bad = UpdateSpec::new().inc("logs", 1);
    assert!(collection.find_one_and_update("2", &bad).await.is_err());
    let unchanged = collection.find_one("2").await.unwrap().unwrap();
    assert_eq!(unchanged, doc);
}

#[tokio::test]
async fn test_concurrent_upserts_serialize() {
    let collection = fresh_collection().await;
    let writes = (0..10).map(|_| {
        let collection = Arc::clone(&collection);
        async move {
            collection
                .find_one_and_update("3", &UpdateSpec::new().inc("counter", 1))
                .await
        }
    });
    for result in futures_util::future::join_all(writes).await {
        result.unwrap();
    }
    let doc = collection.find_one("3").await.unwrap().unwrap();
    assert_eq!(doc["counter"], 10);
    assert_eq!(collection.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_watch_delivers_post_images() {
    let collection = fresh_collection().await;
    let mut stream = collection.watch().await.unwrap();

    collection.insert_one(json!({"tenant_id": "4"})).await.unwrap();
    collection
        .find_one_and_update("4", &UpdateSpec::new().set("prefix", "!"))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.kind, ChangeKind::Insert);
    let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.kind, ChangeKind::Update);
    assert_eq!(second.document["prefix"], "!");
}

#[tokio::test]
async fn test_store_converges_across_processes() {
    let collection = fresh_collection().await;
    let store = TenantStore::with_timeout(collection.clone(), Duration::from_secs(5));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed = store.start_change_feed(FeedConfig::development(), shutdown_rx);

    let mut states = store.subscribe_feed_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == FeedState::Live),
    )
    .await
    .unwrap()
    .unwrap();

    let id = TenantId::new(5);
    assert_eq!(store.get_config(id).await.unwrap().prefix().unwrap(), "!!");

    collection
        .find_one_and_update("5", &UpdateSpec::new().set("prefix", "$"))
        .await
        .unwrap();
    let shared = &store;
    eventually("remote write visible", || async move {
        shared.get_config(id).await.unwrap().prefix().unwrap() == "$"
    })
    .await;

    shutdown_tx.send(true).unwrap();
    feed.await.unwrap().unwrap();
}
