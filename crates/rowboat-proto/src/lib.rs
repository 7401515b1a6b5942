//! Shared protocol definitions for the rowboat synchronization layer.
//! Keeping the envelope and patch shapes in a dedicated crate keeps the
//! client and server wire formats in sync without pulling in heavier
//! runtime code on either side.

pub mod error;
pub mod message;
pub mod op;

pub use error::SyncError;
pub use message::{code, Action, DocKey, Envelope, ErrorPayload, PROTOCOL_VERSION};
pub use op::{apply_patch, apply_patches, invert, validate_ops, Patch, PatchError, PathSegment};
