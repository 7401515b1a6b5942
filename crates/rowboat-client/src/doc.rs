//! Per-document client proxy: the authoritative local mirror of one
//! `(collection, id)` pair.
//!
//! Submissions apply to the mirror immediately so callers observe their own
//! edits synchronously; each pending submission keeps the inverse patches so
//! a server rejection can restore the mirror bit for bit. The server's echo
//! of a locally submitted operation is recognized by the `(src, seq)` tag
//! and resolves the pending submission without re-applying anything.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use rowboat_proto::{
    apply_patch, code, invert, validate_ops, DocKey, Envelope, Patch, SyncError,
};

use crate::connection::ConnInner;

/// Emitted on every change to the local mirror: remote operations, local
/// optimistic applies and rollbacks.
#[derive(Debug, Clone)]
pub struct DocEvent {
    pub patches: Vec<Patch>,
    /// True when the change originated from this connection (optimistic
    /// apply or rollback), false for operations from other clients.
    pub local: bool,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub data: Value,
}

pub(crate) struct PendingSubmission {
    pub(crate) seq: u64,
    pub(crate) base_version: u64,
    pub(crate) inverses: Vec<Patch>,
    pub(crate) ack: oneshot::Sender<Result<u64, SyncError>>,
}

pub(crate) struct DocState {
    pub(crate) version: u64,
    pub(crate) data: Value,
    pub(crate) subscribed: bool,
    pub(crate) pending: VecDeque<PendingSubmission>,
    pub(crate) snapshot_waiters: Vec<oneshot::Sender<Result<Snapshot, SyncError>>>,
}

pub(crate) struct DocShared {
    pub(crate) key: DocKey,
    pub(crate) state: Mutex<DocState>,
    pub(crate) events: broadcast::Sender<DocEvent>,
}

impl DocShared {
    pub(crate) fn new(key: DocKey) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            key,
            state: Mutex::new(DocState {
                version: 0,
                data: Value::Object(Map::new()),
                subscribed: false,
                pending: VecDeque::new(),
                snapshot_waiters: Vec::new(),
            }),
            events,
        }
    }

    /// A snapshot arrived (`s` or `f` reply). Replaces the mirror wholesale
    /// and wakes every waiter. A rejection leaves the mirror untouched and
    /// fails the waiters instead.
    pub(crate) fn on_snapshot(&self, env: Envelope, mark_subscribed: bool) {
        let mut state = self.state.lock();
        if let Some(error) = env.error {
            warn!(doc = %self.key, code = %error.code, "snapshot request rejected");
            let sync_error = match error.code.as_str() {
                code::UNAUTHORIZED => SyncError::Unauthorized,
                _ => SyncError::Server(error.message),
            };
            for waiter in state.snapshot_waiters.drain(..) {
                let _ = waiter.send(Err(sync_error.clone()));
            }
            return;
        }
        state.version = env.v.unwrap_or(0);
        state.data = env.data.unwrap_or_else(|| Value::Object(Map::new()));
        if mark_subscribed {
            state.subscribed = true;
        }
        let snapshot = Snapshot {
            version: state.version,
            data: state.data.clone(),
        };
        for waiter in state.snapshot_waiters.drain(..) {
            let _ = waiter.send(Ok(snapshot.clone()));
        }
    }

    /// An `op` envelope arrived: an ack or rejection for one of our pending
    /// submissions, or a genuinely remote operation.
    ///
    /// Accepted operations carry consecutive versions. A broadcast at or
    /// below the mirror version was already accounted for (it is contained
    /// in the snapshot, or a redelivery) and is dropped; one that skips
    /// ahead means an operation was missed. Returns true in the latter case
    /// so the caller re-fetches the document.
    pub(crate) fn on_op(&self, env: Envelope, local_id: Option<&str>) -> bool {
        let mut state = self.state.lock();

        if let Some(error) = env.error {
            let Some(seq) = env.seq else {
                warn!(doc = %self.key, code = %error.code, "dropping rejection without a sequence");
                return false;
            };
            let Some(position) = state.pending.iter().position(|p| p.seq == seq) else {
                debug!(doc = %self.key, seq, "rejection for an unknown submission");
                return false;
            };
            if let Some(pending) = state.pending.remove(position) {
                let rollback: Vec<Patch> = pending.inverses.iter().rev().cloned().collect();
                for inverse in &rollback {
                    if let Err(err) = apply_patch(&mut state.data, inverse) {
                        warn!(doc = %self.key, error = %err, "rollback patch failed to apply");
                    }
                }
                let _ = self.events.send(DocEvent {
                    patches: rollback,
                    local: true,
                });
                let sync_error = match error.code.as_str() {
                    code::VERSION_CONFLICT => SyncError::VersionConflict {
                        submitted: pending.base_version,
                        current: env.v.unwrap_or(0),
                    },
                    code::UNAUTHORIZED => SyncError::Unauthorized,
                    _ => SyncError::Server(error.message),
                };
                let _ = pending.ack.send(Err(sync_error));
            }
            return false;
        }

        let is_echo = matches!((&env.src, local_id), (Some(src), Some(id)) if src == id);
        if is_echo {
            let Some(seq) = env.seq else { return false };
            let mut skipped_ahead = false;
            if let Some(position) = state.pending.iter().position(|p| p.seq == seq) {
                if let Some(pending) = state.pending.remove(position) {
                    if let Some(version) = env.v {
                        skipped_ahead = version > state.version + 1;
                        state.version = version;
                    }
                    // Already applied optimistically; only the version moves.
                    let _ = pending.ack.send(Ok(state.version));
                }
            }
            // An ack further ahead than expected means broadcasts for other
            // clients' operations were missed in between.
            return skipped_ahead;
        }

        let Some(patches) = env.op else {
            debug!(doc = %self.key, "operation envelope without patches");
            return false;
        };
        let version = env.v.unwrap_or(state.version + 1);
        if version <= state.version {
            debug!(doc = %self.key, version, mirror = state.version, "dropping stale broadcast");
            return false;
        }
        if version > state.version + 1 {
            warn!(doc = %self.key, version, mirror = state.version, "missed an operation; resynchronizing");
            return true;
        }
        for patch in &patches {
            if let Err(err) = apply_patch(&mut state.data, patch) {
                warn!(doc = %self.key, error = %err, "remote patch failed to apply");
            }
        }
        state.version = version;
        let _ = self.events.send(DocEvent {
            patches,
            local: false,
        });
        false
    }

    /// Remove a timed-out or unsendable submission and restore the mirror.
    pub(crate) fn abort_pending(&self, seq: u64) {
        let mut state = self.state.lock();
        let Some(position) = state.pending.iter().position(|p| p.seq == seq) else {
            return;
        };
        if let Some(pending) = state.pending.remove(position) {
            let rollback: Vec<Patch> = pending.inverses.iter().rev().cloned().collect();
            for inverse in &rollback {
                if let Err(err) = apply_patch(&mut state.data, inverse) {
                    warn!(doc = %self.key, error = %err, "rollback patch failed to apply");
                }
            }
            let _ = self.events.send(DocEvent {
                patches: rollback,
                local: true,
            });
        }
    }

    /// Reject every pending submission, newest first so the inverse patches
    /// compose correctly when rolling back.
    pub(crate) fn fail_pending(&self, error: SyncError, rollback: bool) {
        let mut state = self.state.lock();
        while let Some(pending) = state.pending.pop_back() {
            if rollback {
                let patches: Vec<Patch> = pending.inverses.iter().rev().cloned().collect();
                for inverse in &patches {
                    if let Err(err) = apply_patch(&mut state.data, inverse) {
                        warn!(doc = %self.key, error = %err, "rollback patch failed to apply");
                    }
                }
                let _ = self.events.send(DocEvent {
                    patches,
                    local: true,
                });
            }
            let _ = pending.ack.send(Err(error.clone()));
        }
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }
}

/// Handle for one synchronized document.
///
/// Cheap to clone-construct via [`Connection::doc`]; all clones share the
/// same mirror.
pub struct Doc {
    pub(crate) conn: Arc<ConnInner>,
    pub(crate) shared: Arc<DocShared>,
}

impl Doc {
    pub fn collection(&self) -> &str {
        &self.shared.key.collection
    }

    pub fn id(&self) -> &str {
        &self.shared.key.id
    }

    /// Clone of the current local mirror.
    pub fn data(&self) -> Value {
        self.shared.state.lock().data.clone()
    }

    pub fn version(&self) -> u64 {
        self.shared.state.lock().version
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.is_subscribed()
    }

    /// Change notifications. Each call returns an independent receiver.
    pub fn events(&self) -> broadcast::Receiver<DocEvent> {
        self.shared.events.subscribe()
    }

    /// Combined fetch+subscribe. Resolves with the server snapshot. When
    /// nothing arrives within `fetch_timeout`, the document is treated as
    /// newly created: version 0, empty data. Availability wins over strict
    /// consistency for never-before-seen ids.
    pub async fn subscribe(&self) -> Result<Snapshot, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.shared.state.lock().snapshot_waiters.push(tx);
        self.conn.send(Envelope::subscribe(&self.shared.key))?;

        match timeout(self.conn.config.fetch_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Destroyed),
            Err(_) => {
                let mut state = self.shared.state.lock();
                if !state.subscribed {
                    state.subscribed = true;
                    state.version = 0;
                    state.data = Value::Object(Map::new());
                }
                Ok(Snapshot {
                    version: state.version,
                    data: state.data.clone(),
                })
            }
        }
    }

    /// Re-read the latest server snapshot without changing the subscription.
    pub async fn fetch(&self) -> Result<Snapshot, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.shared.state.lock().snapshot_waiters.push(tx);
        self.conn.send(Envelope::fetch(&self.shared.key))?;

        match timeout(self.conn.config.fetch_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Destroyed),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Submit an operation. The patches apply to the local mirror before the
    /// envelope leaves the process; on rejection they are undone with the
    /// previous values they carried. Resolves with the new server version.
    pub async fn submit(&self, patches: Vec<Patch>) -> Result<u64, SyncError> {
        validate_ops(&patches)?;
        if !self.conn.is_connected() {
            return Err(SyncError::ConnectionLost);
        }
        let src = self
            .conn
            .connection_id()
            .ok_or(SyncError::ConnectionLost)?;
        let seq = self.conn.next_seq();
        let (ack_tx, ack_rx) = oneshot::channel();

        let base_version = {
            let mut state = self.shared.state.lock();
            if !state.subscribed {
                return Err(SyncError::NotSubscribed);
            }
            let mut inverses = Vec::with_capacity(patches.len());
            for patch in &patches {
                let inverse = invert(patch);
                if let Err(err) = apply_patch(&mut state.data, patch) {
                    for applied in inverses.iter().rev() {
                        let _ = apply_patch(&mut state.data, applied);
                    }
                    return Err(SyncError::Patch(err));
                }
                inverses.push(inverse);
            }
            let base_version = state.version;
            state.pending.push_back(PendingSubmission {
                seq,
                base_version,
                inverses,
                ack: ack_tx,
            });
            let _ = self.shared.events.send(DocEvent {
                patches: patches.clone(),
                local: true,
            });
            base_version
        };

        if let Err(err) = self
            .conn
            .send(Envelope::op(&self.shared.key, base_version, patches, &src, seq))
        {
            self.shared.abort_pending(seq);
            return Err(err);
        }

        match timeout(self.conn.config.submit_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Destroyed),
            Err(_) => {
                self.shared.abort_pending(seq);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Best-effort unsubscribe notice; the connection may already be down.
    pub async fn unsubscribe(&self) -> Result<(), SyncError> {
        self.shared.state.lock().subscribed = false;
        let _ = self.conn.send(Envelope::unsubscribe(&self.shared.key));
        Ok(())
    }

    /// Tear the proxy down: send a best-effort unsubscribe, reject all
    /// pending submissions and drop the registry entry.
    pub fn destroy(self) {
        self.shared.state.lock().subscribed = false;
        let _ = self.conn.send(Envelope::unsubscribe(&self.shared.key));
        self.shared.fail_pending(SyncError::Destroyed, false);
        self.conn.remove_doc(&self.shared.key);
    }
}
