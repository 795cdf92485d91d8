//! Command execution
//!
//! Output goes to the supplied writer as pretty JSON or plain lines; logs go
//! through `tracing`.

use crate::cli::{Command, TagAction, UserAction};
use crate::error::{CliError, CliResult};
use crate::tags::TagService;
use rainbot_core::{RainbotError, UpdateSpec};
use rainbot_storage::{
    FeedConfig, InMemoryCollection, PostgresCollection, StoreConfig, TenantStore, UserStore,
};
use serde_json::{json, Value};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;

/// The stores a command runs against.
pub struct Stores {
    pub tenants: TenantStore,
    pub users: UserStore,
}

impl Stores {
    /// Fresh in-memory collections; nothing outlives the process.
    pub fn in_memory(config: &StoreConfig) -> Self {
        Self {
            tenants: TenantStore::new(Arc::new(InMemoryCollection::guilds()), config),
            users: UserStore::new(Arc::new(InMemoryCollection::users()), config),
        }
    }

    /// Connect to PostgreSQL and make sure both tables and their change
    /// triggers exist.
    pub async fn connect(config: &StoreConfig) -> CliResult<Self> {
        let pool = config.create_pool()?;

        let guilds = PostgresCollection::guilds(config, pool.clone())?;
        guilds.ensure_schema().await?;
        let users = PostgresCollection::users(config, pool)?;
        users.ensure_schema().await?;

        tracing::info!(
            host = %config.host,
            dbname = %config.dbname,
            guilds = %config.guilds_table,
            users = %config.users_table,
            "Connected to config store"
        );
        Ok(Self {
            tenants: TenantStore::new(Arc::new(guilds), config),
            users: UserStore::new(Arc::new(users), config),
        })
    }
}

fn parse_operators(raw: &str) -> CliResult<UpdateSpec> {
    let doc: Value = serde_json::from_str(raw)
        .map_err(|e| CliError::invalid_argument("operators", e.to_string()))?;
    UpdateSpec::from_operators(&doc)
        .map_err(|e| CliError::invalid_argument("operators", e.to_string()))
}

fn print_json<W: Write>(out: &mut W, value: &Value) -> CliResult<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Run every command except `watch`, which needs a shutdown signal.
pub async fn execute<W: Write>(command: Command, stores: &Stores, out: &mut W) -> CliResult<()> {
    match command {
        Command::Get {
            tenant,
            path,
            stored,
        } => {
            let view = stores.tenants.get_config(tenant).await?;
            let value = match path {
                _ if stored => view.stored().clone(),
                Some(path) => view.at_path(&path).map_err(RainbotError::from)?.materialize(),
                None => view.materialize(),
            };
            print_json(out, &value)
        }
        Command::Update { tenant, operators } => {
            let update = parse_operators(&operators)?;
            let view = stores.tenants.update_config(tenant, &update).await?;
            print_json(out, &view.materialize())
        }
        Command::Tag { action } => run_tag(action, stores, out).await,
        Command::User { action } => run_user(action, stores, out).await,
        Command::Watch { .. } => Err(CliError::invalid_argument(
            "command",
            "watch runs through `watch`, not `execute`",
        )),
    }
}

async fn run_tag<W: Write>(action: TagAction, stores: &Stores, out: &mut W) -> CliResult<()> {
    let tags = TagService::new(stores.tenants.clone());
    match action {
        TagAction::Create {
            tenant,
            name,
            value,
        } => {
            tags.create(tenant, &name, &value.join(" ")).await?;
            writeln!(out, "Created tag {}", name)?;
        }
        TagAction::Remove { tenant, name } => {
            tags.remove(tenant, &name).await?;
            writeln!(out, "Removed tag {}", name)?;
        }
        TagAction::List { tenant } => {
            let names = tags.list(tenant).await?;
            if names.is_empty() {
                writeln!(out, "No tags saved")?;
            } else {
                writeln!(out, "Tags: {}", names.join(", "))?;
            }
        }
        TagAction::Show { tenant, name } => {
            writeln!(out, "{}", tags.lookup(tenant, &name).await?)?;
        }
    }
    Ok(())
}

async fn run_user<W: Write>(action: UserAction, stores: &Stores, out: &mut W) -> CliResult<()> {
    match action {
        UserAction::Get { user } => match stores.users.get_user(user).await? {
            Some(document) => print_json(out, document.as_value()),
            None => print_json(out, &Value::Null),
        },
        UserAction::Update { user, operators } => {
            let update = parse_operators(&operators)?;
            let document = stores.users.update_user(user, &update).await?;
            print_json(out, document.as_value())
        }
    }
}

/// Follow the change feed until `shutdown` resolves or the feed gives up,
/// then print feed metrics and cache statistics.
pub async fn watch<W, F>(stores: &Stores, config: FeedConfig, shutdown: F, out: &mut W) -> CliResult<()>
where
    W: Write,
    F: Future<Output = ()>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut feed = stores.tenants.start_change_feed(config, shutdown_rx);
    let mut states = stores.tenants.subscribe_feed_state();
    let mut shutdown = std::pin::pin!(shutdown);

    let joined = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
                break (&mut feed).await;
            }
            joined = &mut feed => break joined,
            Ok(()) = states.changed() => {
                let state = *states.borrow_and_update();
                tracing::info!(state = %state, "Change feed state changed");
            }
        }
    };

    let metrics = joined??;
    let cache = stores.tenants.cache_stats().await?;
    print_json(
        out,
        &json!({
            "feed": metrics,
            "cache": cache,
        }),
    )
}
