//! Change feed convergence, reconnect and failure handling.

use rainbot_core::{RainbotError, StorageError, TenantId, UpdateSpec};
use rainbot_storage::{DocumentCollection, FeedConfig, FeedState, TenantStore};
use rainbot_test_utils::fixtures::{eventually, memory_tenant_store};
use std::time::Duration;
use tokio::sync::watch;

async fn wait_for_state(store: &TenantStore, wanted: FeedState) {
    let mut states = store.subscribe_feed_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
        .await
        .expect("feed state not reached")
        .expect("feed state sender dropped");
}

async fn prefix_of(store: &TenantStore, id: TenantId) -> String {
    store
        .get_config(id)
        .await
        .unwrap()
        .prefix()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_external_write_reaches_cache() {
    let (store, collection) = memory_tenant_store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed = store.start_change_feed(FeedConfig::development(), shutdown_rx);
    wait_for_state(&store, FeedState::Live).await;

    let id = TenantId::new(40);
    assert_eq!(prefix_of(&store, id).await, "!!");

    // Another process writes straight to the store.
    collection
        .find_one_and_update("40", &UpdateSpec::new().set("prefix", "+"))
        .await
        .unwrap();

    let shared = &store;
    eventually("external prefix visible", || async move {
        prefix_of(shared, id).await == "+"
    })
    .await;
    // Served from cache: only the initial miss went to the store.
    assert_eq!(collection.operation_counts("40").finds, 1);

    shutdown_tx.send(true).unwrap();
    let metrics = feed.await.unwrap().unwrap();
    assert!(metrics.events_applied >= 1);
    assert_eq!(store.feed_state(), FeedState::Stopped);
}

#[tokio::test]
async fn test_stream_loss_invalidates_and_reconnects() {
    let (store, collection) = memory_tenant_store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed = store.start_change_feed(FeedConfig::development(), shutdown_rx);
    wait_for_state(&store, FeedState::Live).await;

    let id = TenantId::new(41);
    assert_eq!(prefix_of(&store, id).await, "!!");

    collection.close_feed();
    collection
        .find_one_and_update("41", &UpdateSpec::new().set("prefix", "#"))
        .await
        .unwrap();

    let shared = &store;
    let backend = &collection;
    eventually("write made during the gap is visible", || async move {
        prefix_of(shared, id).await == "#"
    })
    .await;
    eventually("feed resubscribed", || async move {
        backend.subscriber_count() == 1 && shared.feed_state() == FeedState::Live
    })
    .await;

    let stats = store.cache_stats().await.unwrap();
    assert!(stats.invalidations >= 1);

    shutdown_tx.send(true).unwrap();
    let metrics = feed.await.unwrap().unwrap();
    assert!(metrics.failures >= 1);
    assert!(metrics.reconnects >= 1);
}

#[tokio::test]
async fn test_read_during_backoff_does_not_outlive_reconnect() {
    let (store, collection) = memory_tenant_store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = FeedConfig::development()
        .with_backoff(Duration::from_millis(300), Duration::from_millis(300));
    let feed = store.start_change_feed(config, shutdown_rx);
    wait_for_state(&store, FeedState::Live).await;

    collection.close_feed();
    wait_for_state(&store, FeedState::Reconnecting).await;

    // Loaded while no subscription is open, then changed behind our back.
    let id = TenantId::new(77);
    assert_eq!(prefix_of(&store, id).await, "!!");
    collection
        .find_one_and_update("77", &UpdateSpec::new().set("prefix", "+"))
        .await
        .unwrap();

    wait_for_state(&store, FeedState::Live).await;
    let shared = &store;
    eventually("write made during backoff is visible", || async move {
        prefix_of(shared, id).await == "+"
    })
    .await;

    shutdown_tx.send(true).unwrap();
    let metrics = feed.await.unwrap().unwrap();
    assert!(metrics.reconnects >= 1);
}

#[tokio::test]
async fn test_outage_recovers_without_restart() {
    let (store, collection) = memory_tenant_store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed = store.start_change_feed(FeedConfig::development(), shutdown_rx);
    wait_for_state(&store, FeedState::Live).await;

    collection.set_available(false);
    wait_for_state(&store, FeedState::Reconnecting).await;
    collection.set_available(true);
    wait_for_state(&store, FeedState::Live).await;

    let id = TenantId::new(42);
    assert_eq!(prefix_of(&store, id).await, "!!");
    collection
        .find_one_and_update("42", &UpdateSpec::new().set("prefix", "&"))
        .await
        .unwrap();
    let shared = &store;
    eventually("write after recovery is visible", || async move {
        prefix_of(shared, id).await == "&"
    })
    .await;

    shutdown_tx.send(true).unwrap();
    feed.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_feed_bypasses_cache() {
    let (store, collection) = memory_tenant_store();
    collection.set_available(false);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = FeedConfig::development().with_max_failures(2);
    let feed = store.start_change_feed(config, shutdown_rx);

    let err = feed.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        RainbotError::Storage(StorageError::FeedTerminated { failures: 2 })
    );
    assert_eq!(store.feed_state(), FeedState::Failed);

    collection.set_available(true);
    let id = TenantId::new(43);
    assert_eq!(prefix_of(&store, id).await, "!!");
    collection
        .find_one_and_update("43", &UpdateSpec::new().set("prefix", "~"))
        .await
        .unwrap();

    // Without a feed every read goes to the store, so the write is seen at once.
    assert_eq!(prefix_of(&store, id).await, "~");
    assert_eq!(collection.operation_counts("43").finds, 2);
}

#[tokio::test]
async fn test_own_updates_are_not_regressed_by_feed() {
    let (store, _collection) = memory_tenant_store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed = store.start_change_feed(FeedConfig::development(), shutdown_rx);
    wait_for_state(&store, FeedState::Live).await;

    let id = TenantId::new(44);
    for prefix in ["a", "b", "c"] {
        store
            .update_config(id, &UpdateSpec::new().set("prefix", prefix))
            .await
            .unwrap();
    }

    // Feed events arrive in commit order, so the cache settles on the last write.
    let shared = &store;
    eventually("feed drained", || async move {
        shared.cache_stats().await.unwrap().feed_updates >= 3
    })
    .await;
    assert_eq!(prefix_of(&store, id).await, "c");

    shutdown_tx.send(true).unwrap();
    feed.await.unwrap().unwrap();
}
