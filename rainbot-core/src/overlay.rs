//! Overlay view over sparse configuration documents
//!
//! A [`ConfigView`] pairs a stored (possibly sparse) tenant document with the
//! default schema tree. Every access resolves against the stored value first
//! and falls back to the default at the same path, recursively, so a
//! partially specified nested object still defaults its missing leaves.
//!
//! Views are borrow-only: nothing here can write to the stored document or to
//! the default tree. The only sanctioned write path is an update against the
//! remote store, which produces a fresh view.
//!
//! # Example
//!
//! ```
//! use rainbot_core::ConfigView;
//! use serde_json::json;
//!
//! let view = ConfigView::try_new(json!({
//!     "tenant_id": "1",
//!     "logs": { "member_join": "5550" },
//! })).unwrap();
//!
//! // stored leaf
//! assert_eq!(view.at_path("logs.member_join").unwrap().as_str(), Some("5550"));
//! // sibling leaf missing from the stored group comes from the defaults
//! assert!(view.at_path("logs.member_ban").unwrap().is_null());
//! // whole field missing from the document
//! assert_eq!(view.prefix().unwrap(), "!!");
//! ```

use crate::error::OverlayError;
use crate::identity::{DocumentKey, TenantId};
use crate::schema::default_schema;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// NODE
// ============================================================================

/// A resolved overlay value.
///
/// The shape is decided once when the value is wrapped; container variants
/// carry the correspondingly scoped default subtree.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Scalar(&'a Value),
    Mapping(MapView<'a>),
    Sequence(SeqView<'a>),
}

impl<'a> Node<'a> {
    /// Wrap `value`, using `default` as the same-path default subtree.
    ///
    /// A default of a different shape than the value is ignored.
    pub fn wrap(value: &'a Value, default: Option<&'a Value>) -> Self {
        match value {
            Value::Object(map) => Node::Mapping(MapView {
                raw: value,
                map,
                default: default.and_then(Value::as_object),
            }),
            Value::Array(items) => Node::Sequence(SeqView {
                raw: value,
                items,
                default: default.and_then(Value::as_array).map(Vec::as_slice),
            }),
            scalar => Node::Scalar(scalar),
        }
    }

    /// The value this node resolved to, without any defaults merged in.
    pub fn raw(&self) -> &'a Value {
        match self {
            Node::Scalar(value) => *value,
            Node::Mapping(map) => map.raw,
            Node::Sequence(seq) => seq.raw,
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw().is_null()
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.raw().as_str()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.raw().as_i64()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.raw().as_u64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.raw().as_bool()
    }

    pub fn as_mapping(&self) -> Option<MapView<'a>> {
        match self {
            Node::Mapping(map) => Some(*map),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<SeqView<'a>> {
        match self {
            Node::Sequence(seq) => Some(*seq),
            _ => None,
        }
    }

    /// Look up `key`, requiring this node to be a mapping.
    pub fn get(&self, key: &str) -> Result<Node<'a>, OverlayError> {
        match self {
            Node::Mapping(map) => map.get(key),
            _ => Err(OverlayError::WrongShape {
                key: key.to_string(),
                expected: "mapping",
            }),
        }
    }

    /// Look up `index`, requiring this node to be a sequence.
    pub fn index(&self, index: usize) -> Result<Node<'a>, OverlayError> {
        match self {
            Node::Sequence(seq) => seq.get(index),
            _ => Err(OverlayError::WrongShape {
                key: index.to_string(),
                expected: "sequence",
            }),
        }
    }

    /// Build an owned, fully defaulted copy of this node.
    pub fn materialize(&self) -> Value {
        match self {
            Node::Scalar(value) => (*value).clone(),
            Node::Mapping(map) => map.materialize(),
            Node::Sequence(seq) => seq.materialize(),
        }
    }
}

// ============================================================================
// MAPPING VIEW
// ============================================================================

/// Overlay over a mapping-shaped value.
#[derive(Clone, Copy)]
pub struct MapView<'a> {
    raw: &'a Value,
    map: &'a Map<String, Value>,
    default: Option<&'a Map<String, Value>>,
}

impl<'a> MapView<'a> {
    /// Resolve `key`.
    ///
    /// A stored value keeps `default[key]` as its own default. A value taken
    /// from the defaults is wrapped with nothing beneath it, since the
    /// default tree is ground truth from there on.
    pub fn get(&self, key: &str) -> Result<Node<'a>, OverlayError> {
        let default = self.default.and_then(|d| d.get(key));
        match (self.map.get(key), default) {
            (Some(value), default) => Ok(Node::wrap(value, default)),
            (None, Some(default)) => Ok(Node::wrap(default, None)),
            (None, None) => Err(OverlayError::KeyNotFound {
                key: key.to_string(),
            }),
        }
    }

    /// Resolve `key`, requiring a mapping.
    pub fn mapping(&self, key: &str) -> Result<MapView<'a>, OverlayError> {
        self.get(key)?
            .as_mapping()
            .ok_or_else(|| OverlayError::WrongShape {
                key: key.to_string(),
                expected: "mapping",
            })
    }

    /// Resolve `key`, requiring a sequence.
    pub fn sequence(&self, key: &str) -> Result<SeqView<'a>, OverlayError> {
        self.get(key)?
            .as_sequence()
            .ok_or_else(|| OverlayError::WrongShape {
                key: key.to_string(),
                expected: "sequence",
            })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key) || self.default.is_some_and(|d| d.contains_key(key))
    }

    /// Whether `key` is explicitly present in the stored value.
    pub fn is_set(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Stored keys followed by default-only keys.
    pub fn keys(&self) -> impl Iterator<Item = &'a str> + 'a {
        let map = self.map;
        let defaults = self
            .default
            .into_iter()
            .flat_map(|d| d.keys())
            .filter(move |k| !map.contains_key(k.as_str()));
        map.keys().chain(defaults).map(String::as_str)
    }

    pub fn raw(&self) -> &'a Value {
        self.raw
    }

    pub fn materialize(&self) -> Value {
        let mut out = Map::new();
        for key in self.keys() {
            if let Ok(node) = self.get(key) {
                out.insert(key.to_string(), node.materialize());
            }
        }
        Value::Object(out)
    }
}

impl fmt::Debug for MapView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapView")
            .field("stored", &self.map)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

// ============================================================================
// SEQUENCE VIEW
// ============================================================================

/// Overlay over a sequence-shaped value, defaulting per index.
#[derive(Clone, Copy)]
pub struct SeqView<'a> {
    raw: &'a Value,
    items: &'a [Value],
    default: Option<&'a [Value]>,
}

impl<'a> SeqView<'a> {
    /// Number of addressable indices (stored or defaulted).
    pub fn len(&self) -> usize {
        self.items.len().max(self.default.map_or(0, <[Value]>::len))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<Node<'a>, OverlayError> {
        let default = self.default.and_then(|d| d.get(index));
        match (self.items.get(index), default) {
            (Some(value), default) => Ok(Node::wrap(value, default)),
            (None, Some(default)) => Ok(Node::wrap(default, None)),
            (None, None) => Err(OverlayError::IndexOutOfRange {
                index,
                len: self.len(),
            }),
        }
    }

    /// Lazily wrapped elements.
    pub fn iter(&self) -> impl Iterator<Item = Node<'a>> + 'a {
        let view = *self;
        (0..view.len()).filter_map(move |index| view.get(index).ok())
    }

    /// First mapping element whose `field` equals `value`.
    ///
    /// Elements that are not mappings, or that lack `field` entirely, never
    /// match.
    pub fn find<T>(&self, field: &str, value: T) -> Result<MapView<'a>, OverlayError>
    where
        T: fmt::Debug,
        Value: PartialEq<T>,
    {
        self.iter()
            .filter_map(|node| node.as_mapping())
            .find(|element| {
                element
                    .get(field)
                    .is_ok_and(|candidate| *candidate.raw() == value)
            })
            .ok_or_else(|| OverlayError::NotFound {
                field: field.to_string(),
                value: format!("{:?}", value),
            })
    }

    pub fn raw(&self) -> &'a Value {
        self.raw
    }

    pub fn materialize(&self) -> Value {
        Value::Array(self.iter().map(|node| node.materialize()).collect())
    }
}

impl fmt::Debug for SeqView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqView")
            .field("stored", &self.items)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

// ============================================================================
// CONFIG VIEW
// ============================================================================

static EMPTY_MAPPING: Lazy<Value> = Lazy::new(|| Value::Object(Map::new()));

fn empty_map() -> &'static Map<String, Value> {
    static EMPTY: Lazy<Map<String, Value>> = Lazy::new(Map::new);
    &EMPTY
}

/// Read-only, default-filled view of one tenant's configuration document.
///
/// Cloning shares the stored document; [`ConfigView::duplicate`] deep-copies
/// it. The default tree is always shared.
#[derive(Clone)]
pub struct ConfigView {
    stored: Arc<Value>,
    default: &'static Value,
}

impl ConfigView {
    /// Wrap a stored document using the process-wide default schema.
    pub fn try_new(stored: Value) -> Result<Self, OverlayError> {
        Self::with_default(stored, default_schema())
    }

    /// Wrap a stored document using a custom default tree.
    pub fn with_default(stored: Value, default: &'static Value) -> Result<Self, OverlayError> {
        if !stored.is_object() {
            return Err(OverlayError::WrongShape {
                key: "<root>".to_string(),
                expected: "mapping",
            });
        }
        Ok(Self {
            stored: Arc::new(stored),
            default,
        })
    }

    /// Root mapping view.
    pub fn root(&self) -> MapView<'_> {
        // Constructors only accept mappings, so the empty fallback is never
        // observed through a `ConfigView`.
        let (raw, map) = match self.stored.as_object() {
            Some(map) => (&*self.stored, map),
            None => (&*EMPTY_MAPPING, empty_map()),
        };
        MapView {
            raw,
            map,
            default: self.default.as_object(),
        }
    }

    pub fn get(&self, key: &str) -> Result<Node<'_>, OverlayError> {
        self.root().get(key)
    }

    /// Resolve a dotted path such as `logs.member_join` or `tags.0.name`.
    pub fn at_path(&self, path: &str) -> Result<Node<'_>, OverlayError> {
        let mut node = Node::Mapping(self.root());
        for segment in path.split('.') {
            node = match node {
                Node::Sequence(seq) => {
                    let index = segment.parse::<usize>().map_err(|_| OverlayError::WrongShape {
                        key: segment.to_string(),
                        expected: "mapping",
                    })?;
                    seq.get(index)?
                }
                other => other.get(segment)?,
            };
        }
        Ok(node)
    }

    /// The tenant this document belongs to, if tagged.
    pub fn tenant_id(&self) -> Option<TenantId> {
        TenantId::from_document(&self.stored)
    }

    pub fn prefix(&self) -> Result<&str, OverlayError> {
        self.get("prefix")?
            .as_str()
            .ok_or_else(|| OverlayError::WrongShape {
                key: "prefix".to_string(),
                expected: "string",
            })
    }

    pub fn time_offset(&self) -> Result<i64, OverlayError> {
        self.get("time_offset")?
            .as_i64()
            .ok_or_else(|| OverlayError::WrongShape {
                key: "time_offset".to_string(),
                expected: "integer",
            })
    }

    /// Role id applied on mute; `None` until a moderator configures one.
    pub fn mute_role(&self) -> Result<Option<&str>, OverlayError> {
        let node = self.get("mute_role")?;
        if node.is_null() {
            return Ok(None);
        }
        node.as_str()
            .map(Some)
            .ok_or_else(|| OverlayError::WrongShape {
                key: "mute_role".to_string(),
                expected: "string",
            })
    }

    pub fn tags(&self) -> Result<SeqView<'_>, OverlayError> {
        self.root().sequence("tags")
    }

    /// The raw sparse document as stored.
    pub fn stored(&self) -> &Value {
        &self.stored
    }

    /// The default tree this view falls back to.
    pub fn defaults(&self) -> &'static Value {
        self.default
    }

    /// Fully defaulted owned copy of the document.
    pub fn materialize(&self) -> Value {
        self.root().materialize()
    }

    /// Copy with a deep-copied stored document and the same shared defaults.
    pub fn duplicate(&self) -> Self {
        Self {
            stored: Arc::new(Value::clone(&self.stored)),
            default: self.default,
        }
    }

    /// Whether two views share the same stored allocation.
    pub fn ptr_eq(&self, other: &ConfigView) -> bool {
        Arc::ptr_eq(&self.stored, &other.stored)
    }
}

impl fmt::Debug for ConfigView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigView")
            .field("stored", &self.stored)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ConfigView {
    fn eq(&self, other: &Self) -> bool {
        self.stored == other.stored && std::ptr::eq(self.default, other.default)
    }
}

// ============================================================================
// TESTS
// ============================================================================
