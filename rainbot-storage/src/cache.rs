//! Tenant config cache.
//!
//! A single actor task owns the `TenantId -> ConfigView` map; every read and
//! write goes through a [`CacheHandle`] as a message, so there is exactly one
//! writer and no lock to hold across awaits.
//!
//! Two write paths exist on purpose:
//!
//! - [`CacheHandle::populate`] inserts only when the tenant is absent and
//!   returns whichever entry ends up resident. Cache-miss loads use it, so a
//!   slow initial read never clobbers a newer entry written meanwhile by an
//!   update or the change feed. Each load carries the [`Generation`] seen
//!   at its miss; a load that started before the last
//!   [`CacheHandle::invalidate_all`] is not inserted, since its document may
//!   predate writes the invalidation was meant to forget.
//! - [`CacheHandle::publish`] overwrites unconditionally. Local updates and
//!   change events carry post-write documents and always win.

use rainbot_core::{ConfigView, RainbotResult, StorageError, TenantId};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Where a published entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishSource {
    /// Remote reload (`refresh`, explicit create).
    Load,
    /// Post-image of an update issued by this process.
    LocalUpdate,
    /// Document delivered by the change feed.
    ChangeFeed,
}

/// Invalidation epoch of the cache. Bumped by every `invalidate_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Result of [`CacheHandle::lookup`].
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// The cached view, if any.
    pub entry: Option<ConfigView>,
    /// Generation to pass to [`CacheHandle::populate`] after a miss.
    pub generation: Generation,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entries: u64,
    /// Entries inserted by cache-miss loads.
    pub populated: u64,
    /// Overwrites from remote reloads.
    pub loads: u64,
    /// Overwrites from local updates.
    pub local_updates: u64,
    /// Overwrites from the change feed.
    pub feed_updates: u64,
    /// Number of whole-cache invalidations.
    pub invalidations: u64,
    /// Loads dropped because an invalidation happened while they were in flight.
    pub discarded_loads: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

enum CacheCommand {
    Get {
        tenant_id: TenantId,
        reply: oneshot::Sender<CacheLookup>,
    },
    Populate {
        tenant_id: TenantId,
        view: ConfigView,
        generation: Generation,
        reply: oneshot::Sender<Option<ConfigView>>,
    },
    Publish {
        tenant_id: TenantId,
        view: ConfigView,
        source: PublishSource,
        reply: oneshot::Sender<()>,
    },
    InvalidateAll {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
}

/// Cloneable handle to the cache actor. The actor exits once every handle
/// has been dropped.
#[derive(Clone)]
pub struct CacheHandle {
    commands: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Spawn the actor on the current runtime.
    pub fn spawn(capacity: usize) -> Self {
        let (commands, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(run(receiver));
        Self { commands }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CacheCommand,
    ) -> RainbotResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| StorageError::CacheClosed)?;
        response.await.map_err(|_| StorageError::CacheClosed.into())
    }

    pub async fn get(&self, tenant_id: TenantId) -> RainbotResult<Option<ConfigView>> {
        Ok(self.lookup(tenant_id).await?.entry)
    }

    /// Cached entry plus the current generation, for a later `populate`.
    pub async fn lookup(&self, tenant_id: TenantId) -> RainbotResult<CacheLookup> {
        self.request(|reply| CacheCommand::Get { tenant_id, reply })
            .await
    }

    /// Insert `view` unless the tenant is already cached or the cache was
    /// invalidated since `generation` was observed. Returns the resident
    /// entry, or `view` itself when nothing is resident.
    pub async fn populate(
        &self,
        tenant_id: TenantId,
        view: ConfigView,
        generation: Generation,
    ) -> RainbotResult<ConfigView> {
        let loaded = view.clone();
        let resident = self
            .request(|reply| CacheCommand::Populate {
                tenant_id,
                view,
                generation,
                reply,
            })
            .await?;
        Ok(resident.unwrap_or(loaded))
    }

    /// Overwrite the entry for `tenant_id`. Resolves once the actor has
    /// applied it, so a following `get` observes the new entry.
    pub async fn publish(
        &self,
        tenant_id: TenantId,
        view: ConfigView,
        source: PublishSource,
    ) -> RainbotResult<()> {
        self.request(|reply| CacheCommand::Publish {
            tenant_id,
            view,
            source,
            reply,
        })
        .await
    }

    /// Drop every entry; returns how many were removed.
    pub async fn invalidate_all(&self) -> RainbotResult<usize> {
        self.request(|reply| CacheCommand::InvalidateAll { reply })
            .await
    }

    pub async fn stats(&self) -> RainbotResult<CacheStats> {
        self.request(|reply| CacheCommand::Stats { reply }).await
    }
}

async fn run(mut commands: mpsc::Receiver<CacheCommand>) {
    let mut entries: HashMap<TenantId, ConfigView> = HashMap::new();
    let mut stats = CacheStats::default();
    let mut generation = Generation::default();

    // Replies are best-effort: a caller that gave up (timeout) no longer listens.
    while let Some(command) = commands.recv().await {
        match command {
            CacheCommand::Get { tenant_id, reply } => {
                let hit = entries.get(&tenant_id).cloned();
                if hit.is_some() {
                    stats.hits += 1;
                } else {
                    stats.misses += 1;
                }
                let _ = reply.send(CacheLookup {
                    entry: hit,
                    generation,
                });
            }
            CacheCommand::Populate {
                tenant_id,
                view,
                generation: observed,
                reply,
            } => {
                let resident = if observed == generation {
                    let entry = entries.entry(tenant_id).or_insert_with(|| {
                        stats.populated += 1;
                        view
                    });
                    Some(entry.clone())
                } else {
                    stats.discarded_loads += 1;
                    tracing::debug!(tenant_id = %tenant_id, "Dropping load that raced an invalidation");
                    entries.get(&tenant_id).cloned()
                };
                let _ = reply.send(resident);
            }
            CacheCommand::Publish {
                tenant_id,
                view,
                source,
                reply,
            } => {
                match source {
                    PublishSource::Load => stats.loads += 1,
                    PublishSource::LocalUpdate => stats.local_updates += 1,
                    PublishSource::ChangeFeed => stats.feed_updates += 1,
                }
                entries.insert(tenant_id, view);
                let _ = reply.send(());
            }
            CacheCommand::InvalidateAll { reply } => {
                let dropped = entries.len();
                entries.clear();
                generation = generation.next();
                stats.invalidations += 1;
                let _ = reply.send(dropped);
            }
            CacheCommand::Stats { reply } => {
                let _ = reply.send(CacheStats {
                    entries: entries.len() as u64,
                    ..stats.clone()
                });
            }
        }
    }
    tracing::debug!(entries = entries.len(), "Config cache actor stopped");
}
