//! Error types for the admin CLI

use crate::tags::TagError;
use rainbot_core::RainbotError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Rainbot(#[from] RainbotError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error("Invalid {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("Failed to initialize logging: {0}")]
    Telemetry(String),

    #[error("Failed to render output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CliError {
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Process exit code: 2 for usage mistakes, 3 when the store is down.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument { .. } => 2,
            Self::Rainbot(err) if err.is_store_unavailable() => 3,
            Self::Tag(TagError::Store(err)) if err.is_store_unavailable() => 3,
            _ => 1,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
