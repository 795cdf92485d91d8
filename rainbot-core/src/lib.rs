//! rainbot Core - Configuration Document Types
//!
//! Pure data structures with no I/O: tenant and user identifiers, the default
//! schema tree, the overlay view that fills sparse documents from it, and the
//! update operators that are the only way documents change. All other crates
//! depend on this.

pub mod error;
pub mod identity;
pub mod overlay;
pub mod schema;
pub mod update;
pub mod user;

pub use error::{
    OverlayError, RainbotError, RainbotResult, StorageError, UpdateError, ValidationError,
};
pub use identity::{DocumentKey, TenantId, UserId, TENANT_KEY_FIELD, USER_KEY_FIELD};
pub use overlay::{ConfigView, MapView, Node, SeqView};
pub use schema::{default_schema, new_tenant_document, FieldPath};
pub use update::{pull_matches, UpdateOp, UpdateSpec};
pub use user::UserDocument;
