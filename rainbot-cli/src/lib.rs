//! rainbot-config: admin CLI for guild configuration
//!
//! Boots tracing and the tenant/user stores from the environment, then runs
//! one command against them. The tag service lives here as the first
//! consumer of [`rainbot_storage::TenantConfigs`].

pub mod cli;
pub mod commands;
pub mod error;
pub mod tags;
pub mod telemetry;

pub use cli::{Cli, Command, TagAction, UserAction};
pub use commands::{execute, watch, Stores};
pub use error::{CliError, CliResult};
pub use tags::{TagError, TagResult, TagService};
pub use telemetry::init_tracing;
