//! Client runtime for the rowboat synchronization protocol.
//!
//! One [`Connection`] per process owns the WebSocket, the heartbeat and the
//! reconnect policy, and multiplexes it across any number of [`Doc`] proxies
//! and [`Presence`] channels. Documents apply local edits optimistically and
//! roll them back if the server rejects the submission.

pub mod config;
pub mod connection;
pub mod doc;
pub mod presence;

pub use config::ClientConfig;
pub use connection::{Connection, ConnectionState, ConnectionStatus};
pub use doc::{Doc, DocEvent, Snapshot};
pub use presence::{LocalPresence, Presence, PresenceEvent};

pub use rowboat_proto::{DocKey, Patch, PatchError, PathSegment, SyncError};
