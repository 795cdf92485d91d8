//! rainbot Test Utilities
//!
//! Centralized test infrastructure for the rainbot workspace:
//! - Proptest generators for identifiers, sparse config documents and updates
//! - Fixtures for in-memory backed stores
//! - Custom assertions for rainbot error variants

// Re-export the in-memory backend from its source crate
pub use rainbot_storage::InMemoryCollection;

// Re-export core types for convenience
pub use rainbot_core::{
    default_schema, ConfigView, OverlayError, RainbotError, RainbotResult, StorageError,
    TenantId, UpdateError, UpdateSpec, UserId,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for rainbot documents.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map, Value};

    /// Generate a tenant id in the snowflake range.
    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        (1u64..=u64::MAX >> 1).prop_map(TenantId::new)
    }

    /// Generate a user id in the snowflake range.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        (1u64..=u64::MAX >> 1).prop_map(UserId::new)
    }

    /// Short printable token, as used for prefixes, tag names and channel ids.
    pub fn arb_token() -> impl Strategy<Value = String> {
        "[a-z0-9!?$]{1,8}"
    }

    /// A `{name, value}` tag entry.
    pub fn arb_tag() -> impl Strategy<Value = Value> {
        (arb_token(), arb_token()).prop_map(|(name, value)| json!({"name": name, "value": value}))
    }

    /// A value shaped like `default`: mappings become random sparse subsets
    /// of their keys, sequences become short tag lists, scalars keep their
    /// JSON type (strings and nulls are interchangeable).
    pub fn arb_value_like(default: &'static Value) -> BoxedStrategy<Value> {
        match default {
            Value::Object(map) => {
                let entries: Vec<(&'static str, &'static Value)> =
                    map.iter().map(|(k, v)| (k.as_str(), v)).collect();
                arb_subset(entries)
            }
            Value::Array(_) => prop::collection::vec(arb_tag(), 0..4)
                .prop_map(Value::Array)
                .boxed(),
            Value::Number(_) => (-720i64..=720).prop_map(|n| json!(n)).boxed(),
            Value::Bool(_) => any::<bool>().prop_map(Value::Bool).boxed(),
            Value::String(_) | Value::Null => prop_oneof![
                Just(Value::Null),
                arb_token().prop_map(Value::String),
            ]
            .boxed(),
        }
    }

    fn arb_subset(entries: Vec<(&'static str, &'static Value)>) -> BoxedStrategy<Value> {
        let len = entries.len();
        proptest::sample::subsequence(entries, 0..=len)
            .prop_flat_map(|chosen| {
                chosen
                    .into_iter()
                    .map(|(key, default)| {
                        arb_value_like(default).prop_map(move |value| (key.to_string(), value))
                    })
                    .collect::<Vec<_>>()
            })
            .prop_map(|pairs| Value::Object(pairs.into_iter().collect::<Map<String, Value>>()))
            .boxed()
    }

    /// A sparse guild config document tagged with `tenant_id`.
    pub fn arb_sparse_config(tenant_id: TenantId) -> impl Strategy<Value = Value> {
        let entries: Vec<(&'static str, &'static Value)> = default_schema()
            .as_object()
            .map(|map| {
                map.iter()
                    .filter(|(k, _)| k.as_str() != "tenant_id")
                    .map(|(k, v)| (k.as_str(), v))
                    .collect()
            })
            .unwrap_or_default();
        arb_subset(entries).prop_map(move |mut doc| {
            if let Some(map) = doc.as_object_mut() {
                map.insert("tenant_id".to_string(), json!(tenant_id.to_string()));
            }
            doc
        })
    }

    /// Leaf paths under the `logs` group of the default schema.
    fn log_paths() -> Vec<String> {
        default_schema()
            .get("logs")
            .and_then(Value::as_object)
            .map(|logs| logs.keys().map(|k| format!("logs.{}", k)).collect())
            .unwrap_or_default()
    }

    /// An update spec that applies cleanly to any default-shaped document.
    pub fn arb_update_spec() -> impl Strategy<Value = UpdateSpec> {
        let op = prop_oneof![
            arb_token().prop_map(|p| UpdateSpec::new().set("prefix", p)),
            (prop::sample::select(log_paths()), arb_token())
                .prop_map(|(path, channel)| UpdateSpec::new().set(path, channel)),
            arb_tag().prop_map(|tag| UpdateSpec::new().push("tags", tag)),
            arb_token().prop_map(|name| UpdateSpec::new().pull("tags", json!({"name": name}))),
            (-60i64..=60).prop_map(|n| UpdateSpec::new().inc("time_offset", n)),
            Just(UpdateSpec::new().unset("mute_role")),
        ];
        prop::collection::vec(op, 1..5)
            .prop_map(|parts| parts.into_iter().fold(UpdateSpec::new(), UpdateSpec::merge))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;
    use rainbot_storage::{TenantStore, UserStore};
    use serde_json::{json, Value};
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    /// Deadline used by fixture stores.
    pub const TEST_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

    /// A sparse guild document with two tags and a custom prefix.
    pub fn tagged_document(tenant_id: TenantId) -> Value {
        json!({
            "tenant_id": tenant_id.to_string(),
            "prefix": "?",
            "tags": [
                { "name": "rules", "value": "Be nice." },
                { "name": "faq", "value": "See #faq." }
            ]
        })
    }

    /// Tenant store over a fresh in-memory guild collection.
    pub fn memory_tenant_store() -> (TenantStore, Arc<InMemoryCollection>) {
        let collection = Arc::new(InMemoryCollection::guilds());
        let store = TenantStore::with_timeout(collection.clone(), TEST_OPERATION_TIMEOUT);
        (store, collection)
    }

    /// User store over a fresh in-memory user collection.
    pub fn memory_user_store() -> (UserStore, Arc<InMemoryCollection>) {
        let collection = Arc::new(InMemoryCollection::users());
        let store = UserStore::with_timeout(collection.clone(), TEST_OPERATION_TIMEOUT);
        (store, collection)
    }

    /// Poll `check` until it returns true, panicking after five seconds.
    pub async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if check().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("condition never held: {}", what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for rainbot-specific error variants.

    use super::*;

    /// Assert that a RainbotResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &RainbotResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a RainbotResult reports the store as unavailable.
    #[track_caller]
    pub fn assert_store_unavailable<T: std::fmt::Debug>(result: &RainbotResult<T>) {
        match result {
            Err(err) if err.is_store_unavailable() => {}
            other => panic!("Expected StoreUnavailable, got: {:?}", other),
        }
    }

    /// Assert that a scan found no matching element.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &Result<T, OverlayError>) {
        match result {
            Err(OverlayError::NotFound { .. }) => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    /// Assert that a RainbotResult is an update error.
    #[track_caller]
    pub fn assert_update_error<T: std::fmt::Debug>(result: &RainbotResult<T>) {
        match result {
            Err(RainbotError::Update(_)) => {}
            other => panic!("Expected Update error, got: {:?}", other),
        }
    }
}
