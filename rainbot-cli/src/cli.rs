//! Command-line schema for `rainbot-config`.

use clap::{Parser, Subcommand};
use rainbot_core::{TenantId, UserId};

#[derive(Parser, Debug)]
#[command(name = "rainbot-config")]
#[command(about = "Inspect and edit rainbot guild configuration")]
#[command(version)]
/// Command-line arguments.
pub struct Cli {
    /// Use throwaway in-memory collections instead of PostgreSQL
    #[arg(long, global = true)]
    pub in_memory: bool,

    /// Log rainbot crates at debug level
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Per-operation store deadline in milliseconds (overrides RAINBOT_STORE_TIMEOUT_MS)
    #[arg(long, global = true, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a guild's effective config, or one dotted path of it
    Get {
        /// Guild id
        tenant: TenantId,
        /// Dotted path such as `logs.member_join`
        path: Option<String>,
        /// Print only the stored (sparse) document
        #[arg(long, conflicts_with = "path")]
        stored: bool,
    },
    /// Apply an operator document such as '{"$set": {"prefix": "?"}}'
    Update {
        /// Guild id
        tenant: TenantId,
        /// JSON operator document
        operators: String,
    },
    /// Manage a guild's tags
    Tag {
        /// Tag subcommand action.
        #[command(subcommand)]
        action: TagAction,
    },
    /// Read or update a per-user document
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserAction,
    },
    /// Follow the change feed until interrupted, then print feed metrics
    Watch {
        /// Give up after this many consecutive failures (0 retries forever)
        #[arg(long, value_name = "N")]
        max_failures: Option<u32>,
    },
}

/// Tag management subcommands.
#[derive(Subcommand, Debug)]
pub enum TagAction {
    /// Create a tag
    Create {
        tenant: TenantId,
        name: String,
        /// Tag text; remaining words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
    },
    /// Remove a tag
    Remove { tenant: TenantId, name: String },
    /// List tag names
    List { tenant: TenantId },
    /// Print a tag's value
    Show { tenant: TenantId, name: String },
}

/// User document subcommands.
#[derive(Subcommand, Debug)]
pub enum UserAction {
    /// Print the stored document, if any
    Get { user: UserId },
    /// Apply an operator document
    Update { user: UserId, operators: String },
}
