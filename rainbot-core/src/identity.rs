//! Identity types for tenants and users

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Field under which a tenant document stores its identifier.
pub const TENANT_KEY_FIELD: &str = "tenant_id";

/// Field under which a user document stores its identifier.
pub const USER_KEY_FIELD: &str = "user_id";

/// A typed document key.
///
/// Documents are persisted with the key rendered as a decimal string under
/// [`DocumentKey::FIELD`], so the same trait drives lookups and change-feed
/// extraction for both collections.
pub trait DocumentKey: Copy + Eq + std::hash::Hash + fmt::Display + FromStr + Send + Sync + 'static {
    /// Name of the key field inside the stored document.
    const FIELD: &'static str;

    /// Short label used in errors and logs.
    const KIND: &'static str;

    /// The string form stored in documents.
    fn as_key(&self) -> String {
        self.to_string()
    }

    /// Extract the key from a stored document, if present and well-formed.
    fn from_document(doc: &serde_json::Value) -> Option<Self> {
        doc.get(Self::FIELD)?.as_str()?.parse().ok()
    }
}

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident, $field:expr, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            /// Only the canonical decimal form is accepted, so every id has
            /// exactly one stored key.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let canonical = s.bytes().all(|b| b.is_ascii_digit())
                    && !(s.len() > 1 && s.starts_with('0'));
                match s.parse::<u64>() {
                    Ok(raw) if canonical => Ok(Self(raw)),
                    _ => Err(ValidationError::InvalidId {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl DocumentKey for $name {
            const FIELD: &'static str = $field;
            const KIND: &'static str = $kind;
        }
    };
}

snowflake_id!(
    /// Identifier of a served guild (tenant).
    TenantId,
    TENANT_KEY_FIELD,
    "tenant"
);

snowflake_id!(
    /// Identifier of a user.
    UserId,
    USER_KEY_FIELD,
    "user"
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tenant_id_parses_decimal() {
        let id: TenantId = "398294817234".parse().unwrap();
        assert_eq!(id.get(), 398294817234);
        assert_eq!(id.as_key(), "398294817234");
    }

    #[test]
    fn test_tenant_id_rejects_non_numeric() {
        let err = "guild-1".parse::<TenantId>().unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidId {
                kind: "tenant",
                value: "guild-1".to_string()
            }
        );
    }

    #[test]
    fn test_from_document_reads_key_field() {
        let doc = json!({"tenant_id": "77", "prefix": "?"});
        assert_eq!(TenantId::from_document(&doc), Some(TenantId::new(77)));
        assert_eq!(UserId::from_document(&doc), None);

        let numeric = json!({"tenant_id": 77});
        assert_eq!(TenantId::from_document(&numeric), None);
    }

    #[test]
    fn test_only_canonical_decimal_accepted() {
        for raw in [" 5", "5 ", "+5", "05", "", "18446744073709551616"] {
            assert!(raw.parse::<TenantId>().is_err(), "{:?} should be rejected", raw);
        }
        assert_eq!("0".parse::<TenantId>().unwrap(), TenantId::new(0));

        let padded = json!({"tenant_id": " 5"});
        assert_eq!(TenantId::from_document(&padded), None);
    }

    #[test]
    fn test_serializes_as_stored_key() {
        let doc = json!({"tenant_id": TenantId::new(5), "user_id": UserId::new(9)});
        assert_eq!(doc, json!({"tenant_id": "5", "user_id": "9"}));
        assert_eq!(TenantId::from_document(&doc), Some(TenantId::new(5)));
        assert_eq!(UserId::from_document(&doc), Some(UserId::new(9)));

        let id: TenantId = serde_json::from_value(json!("398294817234")).unwrap();
        assert_eq!(id, TenantId::new(398294817234));
        assert!(serde_json::from_value::<TenantId>(json!(5)).is_err());
        assert!(serde_json::from_value::<TenantId>(json!("five")).is_err());
    }
}
