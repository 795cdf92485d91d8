//! Tracing subscriber setup
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! The filter comes from `RAINBOT_LOG`, then `RUST_LOG`, then
//! [`DEFAULT_LOG_FILTER`]. Set `RAINBOT_LOG_FORMAT=json` for JSON lines.

use crate::error::{CliError, CliResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILTER_ENV: &str = "RAINBOT_LOG";
pub const LOG_FORMAT_ENV: &str = "RAINBOT_LOG_FORMAT";
pub const DEFAULT_LOG_FILTER: &str = "warn,rainbot=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_ENV).ok().as_deref())
    }
}

fn env_filter() -> EnvFilter {
    std::env::var(LOG_FILTER_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(verbose: bool) -> CliResult<()> {
    let filter = if verbose {
        env_filter().add_directive(
            "rainbot=debug"
                .parse()
                .map_err(|e| CliError::Telemetry(format!("bad directive: {}", e)))?,
        )
    } else {
        env_filter()
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match LogFormat::from_env() {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|e| CliError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse(None), LogFormat::Text);
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Text);
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
