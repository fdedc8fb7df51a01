//! Session records and the in-memory registry that owns them.

pub mod registry;
pub mod types;

pub use registry::SessionRegistry;
pub use types::{
    Collaborator, ConnectionType, PermissionLevel, SessionPatch, SessionRecord, SessionSpec,
    SessionState, derive_alias,
};
