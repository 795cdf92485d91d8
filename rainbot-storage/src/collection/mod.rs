//! Remote document collections.
//!
//! A collection stores sparse JSON documents keyed by a string id held in
//! the document itself under [`DocumentCollection::key_field`]. Writes are
//! expressed as an [`UpdateSpec`] so the backend can apply them atomically,
//! and every committed write is published on the change stream returned by
//! [`DocumentCollection::watch`] in commit order.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryCollection`]: process-local, used by tests and the CLI's
//!   dry-run mode; supports failure injection.
//! - [`PostgresCollection`]: JSONB table with a `LISTEN/NOTIFY` change feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use rainbot_core::{RainbotResult, UpdateSpec};
use serde_json::Value;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryCollection, OperationCounts};
pub use postgres::PostgresCollection;

/// What kind of write produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
        }
    }
}

/// A committed write, carrying the full post-write document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub document: Value,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, document: Value) -> Self {
        Self {
            kind,
            document,
            observed_at: Utc::now(),
        }
    }
}

/// Stream of change events. An `Err` item or the end of the stream means
/// the subscription is gone and events may have been missed.
pub type ChangeStream = BoxStream<'static, RainbotResult<ChangeEvent>>;

/// A remote collection of keyed documents.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Collection name used in logs.
    fn name(&self) -> &str;

    /// Field inside each document that holds its key.
    fn key_field(&self) -> &str;

    /// Fetch the document stored under `key`.
    async fn find_one(&self, key: &str) -> RainbotResult<Option<Value>>;

    /// Insert a new document. Fails with `StorageError::DuplicateKey` when a
    /// document with the same key already exists.
    async fn insert_one(&self, document: Value) -> RainbotResult<()>;

    /// Atomically apply `update` to the document under `key`, creating it
    /// (seeded with just the key field) when absent. Returns the
    /// post-update document.
    async fn find_one_and_update(&self, key: &str, update: &UpdateSpec) -> RainbotResult<Value>;

    /// Subscribe to committed writes from this point on.
    async fn watch(&self) -> RainbotResult<ChangeStream>;

    /// Number of stored documents.
    async fn count(&self) -> RainbotResult<u64>;
}

/// Key stored in `document` under `key_field`, as a string.
pub(crate) fn document_key<'a>(document: &'a Value, key_field: &str) -> Option<&'a str> {
    document.get(key_field)?.as_str()
}
