//! rainbot-config entry point

use clap::Parser;
use rainbot_cli::{execute, init_tracing, watch, Cli, CliResult, Command, Stores};
use rainbot_storage::{FeedConfig, StoreConfig};
use std::process::ExitCode;
use std::time::Duration;

async fn run(cli: Cli) -> CliResult<()> {
    init_tracing(cli.verbose)?;

    let mut config = StoreConfig::from_env();
    if let Some(ms) = cli.timeout_ms {
        config = config.with_operation_timeout(Duration::from_millis(ms));
    }
    let stores = if cli.in_memory {
        tracing::warn!("Using in-memory collections; changes are discarded on exit");
        Stores::in_memory(&config)
    } else {
        Stores::connect(&config).await?
    };

    let mut out = std::io::stdout().lock();
    match cli.command {
        Command::Watch { max_failures } => {
            let mut feed = FeedConfig::from_env();
            if let Some(failures) = max_failures {
                feed = feed.with_max_failures(failures);
            }
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for ctrl-c");
                }
            };
            watch(&stores, feed, shutdown, &mut out).await
        }
        command => execute(command, &stores, &mut out).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
