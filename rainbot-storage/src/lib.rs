//! rainbot Storage - Remote Collections, Cache and Stores
//!
//! Everything that talks to the remote document store lives here:
//!
//! - [`collection`]: the [`DocumentCollection`] abstraction with in-memory
//!   and PostgreSQL backends.
//! - [`cache`]: the single-writer config cache actor.
//! - [`tenant_store`]: cached per-tenant config access with create-on-first-read.
//! - [`change_feed`]: the listener that keeps the cache in sync with writes
//!   made by other processes.
//! - [`user_store`]: cache-aside access to per-user documents.

pub mod cache;
pub mod change_feed;
pub mod collection;
pub mod config;
pub mod constants;
pub mod tenant_store;
pub mod user_store;

pub use cache::{CacheHandle, CacheLookup, CacheStats, Generation, PublishSource};
pub use change_feed::{ChangeFeedListener, FeedMetrics, FeedMetricsSnapshot, FeedState};
pub use collection::{
    ChangeEvent, ChangeKind, ChangeStream, DocumentCollection, InMemoryCollection,
    OperationCounts, PostgresCollection,
};
pub use config::{FeedConfig, StoreConfig};
pub use tenant_store::{TenantConfigs, TenantStore};
pub use user_store::UserStore;
