//! Ephemeral presence: small per-session payloads (cursor position, "who is
//! viewing") broadcast to co-subscribers of a channel. No version history,
//! no persistence, most recent payload wins. Delivery failures are never
//! retried; the next update supersedes the last.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;

use rowboat_proto::{DocKey, Envelope, SyncError};

use crate::connection::ConnInner;

/// A presence notification. `payload = None` means the session left.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub session_id: String,
    pub payload: Option<Value>,
}

pub(crate) struct PresenceShared {
    pub(crate) key: DocKey,
    pub(crate) subscribed: Mutex<bool>,
    pub(crate) pending: Mutex<HashMap<u64, oneshot::Sender<Result<(), SyncError>>>>,
    pub(crate) events: broadcast::Sender<PresenceEvent>,
}

impl PresenceShared {
    pub(crate) fn new(key: DocKey) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            key,
            subscribed: Mutex::new(false),
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn on_presence(&self, env: Envelope, local_id: Option<&str>) {
        let is_local = matches!((&env.src, local_id), (Some(src), Some(id)) if src == id);
        if let Some(seq) = env.seq {
            if is_local {
                if let Some(ack) = self.pending.lock().remove(&seq) {
                    let _ = ack.send(Ok(()));
                }
                return;
            }
        }
        if is_local {
            return;
        }
        let Some(session_id) = env.id else { return };
        let _ = self.events.send(PresenceEvent {
            session_id,
            payload: env.presence,
        });
    }

    pub(crate) fn fail_pending(&self, error: SyncError) {
        for (_, ack) in self.pending.lock().drain() {
            let _ = ack.send(Err(error.clone()));
        }
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        *self.subscribed.lock()
    }
}

/// Handle for one presence channel, keyed like a document.
pub struct Presence {
    pub(crate) conn: Arc<ConnInner>,
    pub(crate) shared: Arc<PresenceShared>,
}

impl Presence {
    /// Start receiving presence updates for this channel. There is no
    /// snapshot to fetch; the server replays currently known entries as
    /// ordinary updates.
    pub async fn subscribe(&self) -> Result<(), SyncError> {
        *self.shared.subscribed.lock() = true;
        self.conn.send(Envelope::presence_subscribe(&self.shared.key))
    }

    pub async fn unsubscribe(&self) -> Result<(), SyncError> {
        *self.shared.subscribed.lock() = false;
        let _ = self
            .conn
            .send(Envelope::presence_unsubscribe(&self.shared.key));
        Ok(())
    }

    /// Presence updates from other sessions on this channel.
    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.shared.events.subscribe()
    }

    /// A handle publishing presence for one session id.
    pub fn local(&self, session_id: impl Into<String>) -> LocalPresence {
        LocalPresence {
            conn: Arc::clone(&self.conn),
            shared: Arc::clone(&self.shared),
            session_id: session_id.into(),
        }
    }
}

/// Publishes presence payloads for one session.
pub struct LocalPresence {
    conn: Arc<ConnInner>,
    shared: Arc<PresenceShared>,
    session_id: String,
}

impl LocalPresence {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a payload and wait for the server acknowledgment.
    pub async fn submit(&self, payload: Value) -> Result<(), SyncError> {
        let src = self
            .conn
            .connection_id()
            .ok_or(SyncError::ConnectionLost)?;
        let seq = self.conn.next_seq();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending.lock().insert(seq, ack_tx);

        let mut env =
            Envelope::presence_update(&self.shared.key, &self.session_id, Some(payload), &src);
        env.seq = Some(seq);
        if let Err(err) = self.conn.send(env) {
            self.shared.pending.lock().remove(&seq);
            return Err(err);
        }

        match timeout(self.conn.config.submit_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Destroyed),
            Err(_) => {
                self.shared.pending.lock().remove(&seq);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Fire-and-forget payload update, for high-frequency cursor movement.
    pub fn send(&self, payload: Value) -> Result<(), SyncError> {
        let src = self
            .conn
            .connection_id()
            .ok_or(SyncError::ConnectionLost)?;
        self.conn.send(Envelope::presence_update(
            &self.shared.key,
            &self.session_id,
            Some(payload),
            &src,
        ))
    }

    /// Announce that this session left the channel.
    pub fn clear(&self) -> Result<(), SyncError> {
        let src = self
            .conn
            .connection_id()
            .ok_or(SyncError::ConnectionLost)?;
        self.conn.send(Envelope::presence_update(
            &self.shared.key,
            &self.session_id,
            None,
            &src,
        ))
    }
}
