//! Per-user documents
//!
//! User documents are flat and sparse with no default overlay: a missing
//! field is simply missing.

use crate::error::OverlayError;
use crate::identity::{DocumentKey, UserId};
use serde_json::Value;
use std::sync::Arc;

/// Read-only wrapper around a stored user document.
#[derive(Debug, Clone, PartialEq)]
pub struct UserDocument {
    doc: Arc<Value>,
}

impl UserDocument {
    pub fn try_new(doc: Value) -> Result<Self, OverlayError> {
        if !doc.is_object() {
            return Err(OverlayError::WrongShape {
                key: "<root>".to_string(),
                expected: "mapping",
            });
        }
        Ok(Self { doc: Arc::new(doc) })
    }

    pub fn user_id(&self) -> Option<UserId> {
        UserId::from_document(&self.doc)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.doc.get(key)
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_document_has_no_defaults() {
        let user = UserDocument::try_new(json!({"user_id": "5", "notes": ["hi"]})).unwrap();
        assert_eq!(user.user_id(), Some(UserId::new(5)));
        assert_eq!(user.get("notes"), Some(&json!(["hi"])));
        assert_eq!(user.get("prefix"), None);
    }

    #[test]
    fn test_user_document_rejects_scalars() {
        assert!(UserDocument::try_new(json!("5")).is_err());
    }
}
