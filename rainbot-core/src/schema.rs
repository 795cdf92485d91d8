//! Default schema tree and field paths
//!
//! The default tree declares every recognised configuration key together with
//! its zero value. Stored tenant documents are sparse: anything they omit is
//! read from here through the overlay (see [`crate::overlay`]), so adding a
//! field to this tree needs no migration of existing documents.

use crate::error::UpdateError;
use crate::identity::{DocumentKey, TenantId};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

static DEFAULT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "tenant_id": null,
        "logs": {
            "message_delete": null,
            "message_edit": null,
            "member_join": null,
            "member_remove": null,
            "member_ban": null,
            "member_unban": null,
            "vc_state_change": null,
            "channel_create": null,
            "channel_delete": null,
            "role_create": null,
            "role_delete": null
        },
        "modlog": {
            "member_warn": null,
            "member_mute": null,
            "member_unmute": null,
            "member_kick": null,
            "member_ban": null,
            "member_unban": null,
            "member_softban": null,
            "message_purge": null,
            "channel_lockdown": null,
            "channel_slowmode": null
        },
        "time_offset": 0,
        "detections": {
            "filters": [],
            "block_invite": false,
            "english_only": false,
            "auto_purge_trickocord": false,
            "mention_limit": null,
            "spam_detection": null,
            "repetitive_message": null,
            "sexually_explicit": []
        },
        "giveaway": {
            "channel_id": null,
            "role_id": null,
            "emoji_id": null,
            "message_id": null
        },
        "perm_levels": [],
        "command_levels": [],
        "warn_punishments": [],
        "notes": [],
        "warns": [],
        "mutes": [],
        "tags": [],
        "whitelisted_guilds": [],
        "reaction_roles": [],
        "selfroles": [],
        "autoroles": [],
        "ignored_channels": {
            "filter": [],
            "block_invite": [],
            "english_only": [],
            "mention_limit": [],
            "spam_detection": [],
            "repetitive_message": []
        },
        "mute_role": null,
        "prefix": "!!"
    })
});

/// The process-wide default schema tree.
pub fn default_schema() -> &'static Value {
    &DEFAULT_SCHEMA
}

/// A full copy of the default tree tagged with `tenant_id`.
///
/// This is what gets persisted the first time a tenant is seen.
pub fn new_tenant_document(tenant_id: TenantId) -> Value {
    let mut doc = default_schema().clone();
    if let Value::Object(map) = &mut doc {
        map.insert(TenantId::FIELD.to_string(), Value::String(tenant_id.as_key()));
    }
    doc
}

/// A dotted path into a document, e.g. `logs.member_join`.
///
/// Segments are kept as strings; numeric segments address sequence elements
/// when the value at that point is a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, UpdateError> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(UpdateError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(Self {
            segments: path.split('.').map(str::to_string).collect(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, i.e. the top-level field this path touches.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Split into parent segments and the final segment.
    pub fn split_last(&self) -> (&[String], &str) {
        match self.segments.split_last() {
            Some((last, parents)) => (parents, last.as_str()),
            None => (&[], ""),
        }
    }
}

impl FromStr for FieldPath {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}
