//! The error taxonomy both sides of the protocol share.

use thiserror::Error;

use crate::op::PatchError;

/// Failure kinds surfaced by the synchronization layer.
///
/// Transient kinds (`ConnectionLost`, `Timeout`) are retried internally by
/// the connection backoff policy and usually reach callers only as a
/// connection-status change. Terminal and precondition kinds propagate to
/// the call that triggered them and are never retried automatically.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// The credential was rejected. Terminal: reconnecting with the same
    /// token will not help.
    #[error("credential rejected by the server")]
    Unauthorized,
    /// An operation was submitted before the document finished subscribing.
    /// Local precondition failure, never sent over the wire.
    #[error("document is not subscribed")]
    NotSubscribed,
    /// The server rejected a submission whose base version is stale. The
    /// optimistic change has been rolled back; re-fetch before retrying.
    #[error("version conflict: submitted against {submitted}, server is at {current}")]
    VersionConflict { submitted: u64, current: u64 },
    /// The transport dropped while the call was in flight.
    #[error("connection lost")]
    ConnectionLost,
    /// No acknowledgment arrived within the configured timeout.
    #[error("timed out waiting for the server")]
    Timeout,
    /// Persistence or internal server failure.
    #[error("server error: {0}")]
    Server(String),
    /// The connection or document proxy was torn down with the call pending.
    #[error("connection or document was destroyed")]
    Destroyed,
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("protocol violation: {0}")]
    Protocol(String),
}
