//! Error types for rainbot configuration operations

use std::time::Duration;
use thiserror::Error;

/// Overlay access errors.
///
/// `KeyNotFound` and `IndexOutOfRange` mean the path is missing from both the
/// stored document and the default schema, which points at a schema bug.
/// `NotFound` is the ordinary outcome of a scan that matched nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OverlayError {
    #[error("Key not found in document or defaults: {key}")]
    KeyNotFound { key: String },

    #[error("Index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("No element with {field} = {value}")]
    NotFound { field: String, value: String },

    #[error("Expected a {expected} at {key}")]
    WrongShape { key: String, expected: &'static str },
}

/// Update operator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Unknown update operator: {operator}")]
    UnknownOperator { operator: String },

    #[error("Malformed update document: {reason}")]
    Malformed { reason: String },

    #[error("Invalid field path: {path:?}")]
    InvalidPath { path: String },

    #[error("Cannot traverse non-mapping value at {path}")]
    PathConflict { path: String },

    #[error("Field {path} is not a sequence")]
    NotASequence { path: String },

    #[error("Field {path} is not a number")]
    NotANumber { path: String },

    #[error("Field {field} is immutable")]
    ImmutableField { field: String },
}

/// Remote store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("Config cache is no longer running")]
    CacheClosed,

    #[error("Duplicate document for key {key}")]
    DuplicateKey { key: String },

    #[error("Invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("Change feed terminated after {failures} consecutive failures")]
    FeedTerminated { failures: u32 },

    #[error("Invalid store configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
}

impl StorageError {
    /// Whether the remote store could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::StoreUnavailable { .. })
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        StorageError::StoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Unavailability caused by `operation` exceeding its deadline.
    pub fn timed_out(operation: &str, after: Duration) -> Self {
        StorageError::StoreUnavailable {
            reason: format!("{operation} timed out after {}ms", after.as_millis()),
        }
    }
}

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid {kind} id: {value:?}")]
    InvalidId { kind: &'static str, value: String },
}

/// Master error type for all rainbot errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RainbotError {
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl RainbotError {
    /// Whether this error surfaces a remote store outage.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RainbotError::Storage(err) if err.is_unavailable())
    }
}

/// Result type alias for rainbot operations.
pub type RainbotResult<T> = Result<T, RainbotError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_error_display_key_not_found() {
        let err = OverlayError::KeyNotFound {
            key: "prefixx".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Key not found"));
        assert!(msg.contains("prefixx"));
    }

    #[test]
    fn test_overlay_error_display_not_found() {
        let err = OverlayError::NotFound {
            field: "name".to_string(),
            value: "\"z\"".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("name"));
        assert!(msg.contains("\"z\""));
    }

    #[test]
    fn test_storage_error_timeout_counts_as_unavailable() {
        let err = StorageError::timed_out("find_one", Duration::from_millis(250));
        assert!(err.is_unavailable());
        let msg = format!("{}", err);
        assert!(msg.contains("find_one"));
        assert!(msg.contains("250ms"));

        let dup = StorageError::DuplicateKey {
            key: "1".to_string(),
        };
        assert!(!dup.is_unavailable());
    }

    #[test]
    fn test_rainbot_error_from_variants() {
        let overlay = RainbotError::from(OverlayError::IndexOutOfRange { index: 3, len: 1 });
        assert!(matches!(overlay, RainbotError::Overlay(_)));

        let update = RainbotError::from(UpdateError::UnknownOperator {
            operator: "$rename".to_string(),
        });
        assert!(matches!(update, RainbotError::Update(_)));

        let storage = RainbotError::from(StorageError::unavailable("connection refused"));
        assert!(storage.is_store_unavailable());

        let validation = RainbotError::from(ValidationError::InvalidId {
            kind: "tenant",
            value: "abc".to_string(),
        });
        assert!(matches!(validation, RainbotError::Validation(_)));
        assert!(!validation.is_store_unavailable());
    }
}
