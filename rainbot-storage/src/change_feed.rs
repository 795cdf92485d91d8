//! Change Feed Listener
//!
//! Background task that subscribes to the guild collection's change stream
//! and republishes every committed document into the config cache, so writes
//! made by other processes become visible without polling.
//!
//! When the stream fails or ends, events may have been missed. The listener
//! then drops the whole cache and reconnects with exponential backoff. Reads
//! made while it is down still load into the cache, so it drops everything
//! once more as soon as the new subscription is open; from then on every
//! write reaches the cache through the stream. Loads that were in flight
//! across either invalidation are discarded by the cache itself. With
//! [`FeedConfig::max_consecutive_failures`] set, it gives up after that many
//! failures in a row, moves to [`FeedState::Failed`] and returns
//! `StorageError::FeedTerminated`; the tenant store then stops trusting the
//! cache and reads through to the store.
//!
//! # Example
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let feed = store.start_change_feed(FeedConfig::from_env(), shutdown_rx);
//!
//! // Later
//! let _ = shutdown_tx.send(true);
//! let metrics = feed.await??;
//! ```

use crate::cache::{CacheHandle, PublishSource};
use crate::collection::{ChangeEvent, DocumentCollection};
use crate::config::FeedConfig;
use futures_util::StreamExt;
use rainbot_core::{ConfigView, DocumentKey, RainbotError, RainbotResult, StorageError, TenantId};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// STATE
// ============================================================================

/// Lifecycle of the change feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    /// No listener has been started.
    Idle,
    /// Opening the change stream.
    Connecting,
    /// Subscribed and applying events.
    Live,
    /// Stream lost; waiting to reconnect. The cache is cleared on loss and
    /// again on resubscription.
    Reconnecting,
    /// Gave up after too many consecutive failures.
    Failed,
    /// Shut down on request.
    Stopped,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Idle => "idle",
            FeedState::Connecting => "connecting",
            FeedState::Live => "live",
            FeedState::Reconnecting => "reconnecting",
            FeedState::Failed => "failed",
            FeedState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for change feed activity.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    /// Events republished into the cache
    pub events_applied: AtomicU64,

    /// Events dropped because their document had no usable tenant id
    pub events_skipped: AtomicU64,

    /// Stream failures (open errors, stream errors, stream ends)
    pub failures: AtomicU64,

    /// Successful subscriptions after the first one
    pub reconnects: AtomicU64,

    /// Cache entries dropped on stream loss or resubscription
    pub entries_invalidated: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            entries_invalidated: self.entries_invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of feed metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedMetricsSnapshot {
    pub events_applied: u64,
    pub events_skipped: u64,
    pub failures: u64,
    pub reconnects: u64,
    pub entries_invalidated: u64,
}

// ============================================================================
// LISTENER
// ============================================================================

enum SessionEnd {
    Shutdown,
    Lost {
        error: Option<RainbotError>,
        delivered: u64,
    },
}

/// Resolves once shutdown is requested or every shutdown sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Keeps the config cache in sync with a collection's change stream.
pub struct ChangeFeedListener {
    collection: Arc<dyn DocumentCollection>,
    cache: CacheHandle,
    state: Arc<watch::Sender<FeedState>>,
    config: FeedConfig,
    metrics: Arc<FeedMetrics>,
}

impl ChangeFeedListener {
    pub fn new(
        collection: Arc<dyn DocumentCollection>,
        cache: CacheHandle,
        state: Arc<watch::Sender<FeedState>>,
        config: FeedConfig,
    ) -> Self {
        Self {
            collection,
            cache,
            state,
            config,
            metrics: Arc::new(FeedMetrics::new()),
        }
    }

    /// Shared handle to the live counters.
    pub fn metrics(&self) -> Arc<FeedMetrics> {
        Arc::clone(&self.metrics)
    }

    fn set_state(&self, state: FeedState) {
        self.state.send_replace(state);
    }

    /// Run until shutdown is requested or the failure budget is exhausted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RainbotResult<FeedMetricsSnapshot> {
        let mut consecutive_failures: u32 = 0;
        let mut backoff = self.config.initial_backoff;
        let mut subscribed_before = false;

        tracing::info!(
            collection = %self.collection.name(),
            initial_backoff_ms = self.config.initial_backoff.as_millis() as u64,
            max_backoff_ms = self.config.max_backoff.as_millis() as u64,
            max_consecutive_failures = ?self.config.max_consecutive_failures,
            "Change feed listener started"
        );

        loop {
            self.set_state(FeedState::Connecting);
            match self.session(&mut shutdown, &mut subscribed_before).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost { error, delivered } => {
                    if delivered > 0 {
                        consecutive_failures = 0;
                        backoff = self.config.initial_backoff;
                    }
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.metrics.failures.fetch_add(1, Ordering::Relaxed);

                    let reason = error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "change stream ended".to_string());

                    // Events may have been missed while the stream was down.
                    let dropped = match self.cache.invalidate_all().await {
                        Ok(dropped) => dropped,
                        Err(_) => {
                            tracing::debug!("Config cache gone; stopping change feed");
                            break;
                        }
                    };
                    self.metrics
                        .entries_invalidated
                        .fetch_add(dropped as u64, Ordering::Relaxed);

                    if let Some(limit) = self.config.max_consecutive_failures {
                        if consecutive_failures >= limit {
                            self.set_state(FeedState::Failed);
                            tracing::error!(
                                collection = %self.collection.name(),
                                failures = consecutive_failures,
                                reason = %reason,
                                "Change feed failed permanently; reads will bypass the cache"
                            );
                            return Err(StorageError::FeedTerminated {
                                failures: consecutive_failures,
                            }
                            .into());
                        }
                    }

                    self.set_state(FeedState::Reconnecting);
                    tracing::warn!(
                        collection = %self.collection.name(),
                        failures = consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        entries_invalidated = dropped,
                        reason = %reason,
                        "Change feed interrupted; reconnecting"
                    );

                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = self.config.next_backoff(backoff);
                }
            }
        }

        self.set_state(FeedState::Stopped);
        let snapshot = self.metrics.snapshot();
        tracing::info!(
            events_applied = snapshot.events_applied,
            events_skipped = snapshot.events_skipped,
            failures = snapshot.failures,
            reconnects = snapshot.reconnects,
            "Change feed listener stopped"
        );
        Ok(snapshot)
    }

    /// One subscription, from opening the stream until it is lost.
    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        subscribed_before: &mut bool,
    ) -> SessionEnd {
        let mut stream = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
            opened = self.collection.watch() => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    return SessionEnd::Lost {
                        error: Some(error),
                        delivered: 0,
                    }
                }
            },
        };

        // Entries loaded before the stream opened may have missed writes
        // that this subscription will never deliver.
        match self.cache.invalidate_all().await {
            Ok(dropped) => {
                self.metrics
                    .entries_invalidated
                    .fetch_add(dropped as u64, Ordering::Relaxed);
            }
            Err(_) => {
                tracing::debug!("Config cache gone; stopping change feed");
                return SessionEnd::Shutdown;
            }
        }

        if *subscribed_before {
            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        *subscribed_before = true;
        self.set_state(FeedState::Live);
        tracing::info!(collection = %self.collection.name(), "Change feed live");

        let mut delivered = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if self.apply(event).await.is_err() {
                            tracing::debug!("Config cache gone; stopping change feed");
                            return SessionEnd::Shutdown;
                        }
                        delivered += 1;
                    }
                    Some(Err(error)) => {
                        return SessionEnd::Lost {
                            error: Some(error),
                            delivered,
                        }
                    }
                    None => return SessionEnd::Lost { error: None, delivered },
                },
            }
        }
    }

    /// Republish one event. Only fails if the cache actor is gone.
    async fn apply(&self, event: ChangeEvent) -> RainbotResult<()> {
        let Some(tenant_id) = TenantId::from_document(&event.document) else {
            self.metrics.events_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind = event.kind.as_str(),
                "Change event without a valid tenant id; skipping"
            );
            return Ok(());
        };

        let view = match ConfigView::try_new(event.document) {
            Ok(view) => view,
            Err(error) => {
                self.metrics.events_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %error,
                    "Change event with malformed document; skipping"
                );
                return Ok(());
            }
        };

        self.cache
            .publish(tenant_id, view, PublishSource::ChangeFeed)
            .await?;
        self.metrics.events_applied.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            tenant_id = %tenant_id,
            kind = event.kind.as_str(),
            "Applied change event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::InMemoryCollection;
    use rainbot_core::UpdateSpec;
    use serde_json::json;
    use std::time::Duration;

    fn listener(
        collection: Arc<InMemoryCollection>,
        config: FeedConfig,
    ) -> (ChangeFeedListener, CacheHandle, watch::Receiver<FeedState>) {
        let cache = CacheHandle::spawn(16);
        let (state, state_rx) = watch::channel(FeedState::Idle);
        let listener = ChangeFeedListener::new(collection, cache.clone(), Arc::new(state), config);
        (listener, cache, state_rx)
    }

    async fn wait_for(state: &mut watch::Receiver<FeedState>, wanted: FeedState) {
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .expect("state sender dropped");
    }

    #[test]
    fn test_feed_state_display() {
        assert_eq!(FeedState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(FeedState::Live).unwrap(),
            json!("live")
        );
    }

    #[tokio::test]
    async fn test_applies_events_and_stops_on_shutdown() {
        let collection = Arc::new(InMemoryCollection::guilds());
        let (listener, cache, mut state) = listener(collection.clone(), FeedConfig::development());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        wait_for(&mut state, FeedState::Live).await;
        collection
            .find_one_and_update("5", &UpdateSpec::new().set("prefix", "?"))
            .await
            .unwrap();

        let id = TenantId::new(5);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(view) = cache.get(id).await.unwrap() {
                    return view;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        let snapshot = task.await.unwrap().unwrap();
        assert_eq!(snapshot.events_applied, 1);
        assert_eq!(*state.borrow(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn test_skips_documents_without_tenant_id() {
        let collection = Arc::new(InMemoryCollection::new("guilds", "guild_key"));
        let (listener, _cache, mut state) = listener(collection.clone(), FeedConfig::development());
        let metrics = listener.metrics();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        wait_for(&mut state, FeedState::Live).await;
        collection
            .insert_one(json!({"guild_key": "abc"}))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.snapshot().events_skipped == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        let snapshot = task.await.unwrap().unwrap();
        assert_eq!(snapshot.events_applied, 0);
        assert_eq!(snapshot.events_skipped, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_failure_budget() {
        let collection = Arc::new(InMemoryCollection::guilds());
        collection.set_available(false);
        let config = FeedConfig::development().with_max_failures(3);
        let (listener, _cache, state) = listener(collection, config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = listener.run(shutdown_rx).await.unwrap_err();
        assert_eq!(
            err,
            RainbotError::Storage(StorageError::FeedTerminated { failures: 3 })
        );
        assert_eq!(*state.borrow(), FeedState::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let collection = Arc::new(InMemoryCollection::guilds());
        collection.set_available(false);
        let config = FeedConfig::development()
            .with_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let (listener, _cache, mut state) = listener(collection, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        wait_for(&mut state, FeedState::Reconnecting).await;
        shutdown_tx.send(true).unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.failures, 1);
        assert_eq!(*state.borrow(), FeedState::Stopped);
    }
}
