//! PostgreSQL collection backend.
//!
//! Each collection is a table of `(id TEXT PRIMARY KEY, doc JSONB)`. An
//! `AFTER INSERT OR UPDATE` trigger publishes `<op>:<id>` on the
//! `<table>_changes` channel; `watch()` holds a dedicated `LISTEN` session
//! and looks up the committed document for every notification, so events
//! always carry the full post-write document.
//!
//! Updates run in one transaction: seed the row if missing, lock it with
//! `SELECT .. FOR UPDATE`, apply the [`UpdateSpec`] and write it back.
//! Concurrent upserts on the same id therefore serialize on the row lock.

use super::{document_key, ChangeEvent, ChangeKind, ChangeStream, DocumentCollection};
use crate::config::{validate_identifier, StoreConfig};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool, PoolError};
use futures_util::{stream, StreamExt};
use rainbot_core::{
    RainbotError, RainbotResult, StorageError, UpdateSpec, TENANT_KEY_FIELD, USER_KEY_FIELD,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, NoTls};

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn store_error(context: &str, err: tokio_postgres::Error) -> RainbotError {
    StorageError::unavailable(format!("{}: {}", context, err)).into()
}

fn pool_error(err: PoolError) -> RainbotError {
    StorageError::unavailable(format!("connection pool: {}", err)).into()
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// Split a `<op>:<id>` notification payload.
fn parse_payload(payload: &str) -> (ChangeKind, &str) {
    match payload.split_once(':') {
        Some(("INSERT", key)) => (ChangeKind::Insert, key),
        Some((_, key)) => (ChangeKind::Update, key),
        None => (ChangeKind::Update, payload),
    }
}

// ============================================================================
// COLLECTION
// ============================================================================

/// [`DocumentCollection`] backed by a PostgreSQL JSONB table.
pub struct PostgresCollection {
    pool: Pool,
    session: tokio_postgres::Config,
    table: String,
    key_field: String,
    channel: String,
}

impl PostgresCollection {
    /// Bind a collection to `table`. The table name is spliced into SQL and
    /// must be a plain lowercase identifier.
    pub fn new(
        pool: Pool,
        session: tokio_postgres::Config,
        table: impl Into<String>,
        key_field: impl Into<String>,
    ) -> RainbotResult<Self> {
        let table = table.into();
        validate_identifier("table", &table)?;
        let channel = format!("{}_changes", table);
        Ok(Self {
            pool,
            session,
            table,
            key_field: key_field.into(),
            channel,
        })
    }

    /// Guild config collection as configured in `config`.
    pub fn guilds(config: &StoreConfig, pool: Pool) -> RainbotResult<Self> {
        Self::new(
            pool,
            config.session_config()?,
            config.guilds_table.clone(),
            TENANT_KEY_FIELD,
        )
    }

    /// User document collection as configured in `config`.
    pub fn users(config: &StoreConfig, pool: Pool) -> RainbotResult<Self> {
        Self::new(
            pool,
            config.session_config()?,
            config.users_table.clone(),
            USER_KEY_FIELD,
        )
    }

    /// Notification channel carrying this collection's change feed.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Create the table and change-feed trigger if they do not exist yet.
    pub async fn ensure_schema(&self) -> RainbotResult<()> {
        let table = &self.table;
        let channel = &self.channel;
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                doc JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE OR REPLACE FUNCTION {table}_notify_change() RETURNS trigger AS $$
            BEGIN
                PERFORM pg_notify('{channel}', TG_OP || ':' || NEW.id);
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS {table}_change_feed ON {table};
            CREATE TRIGGER {table}_change_feed
                AFTER INSERT OR UPDATE ON {table}
                FOR EACH ROW EXECUTE FUNCTION {table}_notify_change();
            "#
        );
        let client = self.client().await?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| store_error("ensure_schema", e))?;
        tracing::info!(table = %self.table, channel = %self.channel, "Collection schema ready");
        Ok(())
    }

    async fn client(&self) -> RainbotResult<Object> {
        self.pool.get().await.map_err(pool_error)
    }

    fn seed(&self, key: &str) -> Value {
        let mut seed = Map::new();
        seed.insert(self.key_field.clone(), Value::String(key.to_string()));
        Value::Object(seed)
    }
}

async fn lookup(pool: &Pool, sql: &str, key: &str) -> RainbotResult<Option<Value>> {
    let client = pool.get().await.map_err(pool_error)?;
    let row = client
        .query_opt(sql, &[&key])
        .await
        .map_err(|e| store_error("find_one", e))?;
    row.map(|row| row.try_get::<_, Value>(0))
        .transpose()
        .map_err(|e| store_error("decode document", e))
}

#[async_trait]
impl DocumentCollection for PostgresCollection {
    fn name(&self) -> &str {
        &self.table
    }

    fn key_field(&self) -> &str {
        &self.key_field
    }

    async fn find_one(&self, key: &str) -> RainbotResult<Option<Value>> {
        let sql = format!("SELECT doc FROM {} WHERE id = $1", self.table);
        lookup(&self.pool, &sql, key).await
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
        let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", self.table);
        let client = self.client().await?;
        match client.execute(&sql, &[&key, &document]).await {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateKey { key }.into()),
            Err(e) => Err(store_error("insert_one", e)),
        }
    }

    async fn find_one_and_update(&self, key: &str, update: &UpdateSpec) -> RainbotResult<Value> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| store_error("begin", e))?;

        let seed = self.seed(key);
        tx.execute(
            &format!(
                "INSERT INTO {} (id, doc) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
                self.table
            ),
            &[&key, &seed],
        )
        .await
        .map_err(|e| store_error("seed", e))?;

        let row = tx
            .query_one(
                &format!("SELECT doc FROM {} WHERE id = $1 FOR UPDATE", self.table),
                &[&key],
            )
            .await
            .map_err(|e| store_error("lock", e))?;
        let mut document: Value = row
            .try_get(0)
            .map_err(|e| store_error("decode document", e))?;

        // An invalid update drops the transaction, rolling back the seed row.
        update.apply(&mut document, &self.key_field)?;

        tx.execute(
            &format!(
                "UPDATE {} SET doc = $2, updated_at = now() WHERE id = $1",
                self.table
            ),
            &[&key, &document],
        )
        .await
        .map_err(|e| store_error("find_one_and_update", e))?;
        tx.commit().await.map_err(|e| store_error("commit", e))?;
        Ok(document)
    }

    async fn watch(&self) -> RainbotResult<ChangeStream> {
        let (listener, mut connection) = self
            .session
            .connect(NoTls)
            .await
            .map_err(|e| store_error("listen connect", e))?;

        let (sender, mut notifications) = mpsc::unbounded_channel::<Result<String, String>>();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut messages = Box::pin(stream::poll_fn(move |cx| connection.poll_message(cx)));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if sender.send(Ok(notification.payload().to_string())).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = sender.send(Err(format!("listen connection: {}", err)));
                        break;
                    }
                }
            }
            tracing::debug!(channel = %channel, "Listen connection closed");
        });

        listener
            .batch_execute(&format!("LISTEN {}", self.channel))
            .await
            .map_err(|e| store_error("listen", e))?;
        tracing::debug!(channel = %self.channel, "Listening for changes");

        let pool = self.pool.clone();
        let select = format!("SELECT doc FROM {} WHERE id = $1", self.table);
        let stream = async_stream::stream! {
            // Dropping the stream drops the session, which ends the driver task.
            let _listener = listener;
            while let Some(message) = notifications.recv().await {
                let payload = match message {
                    Ok(payload) => payload,
                    Err(reason) => {
                        yield Err(RainbotError::from(StorageError::unavailable(reason)));
                        break;
                    }
                };
                let (kind, key) = parse_payload(&payload);
                match lookup(&pool, &select, key).await {
                    Ok(Some(document)) => yield Ok(ChangeEvent::new(kind, document)),
                    Ok(None) => continue,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn count(&self) -> RainbotResult<u64> {
        let client = self.client().await?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", self.table), &[])
            .await
            .map_err(|e| store_error("count", e))?;
        let count: i64 = row.try_get(0).map_err(|e| store_error("count", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
