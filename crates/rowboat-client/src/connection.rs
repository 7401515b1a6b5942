//! The single transport connection per client process.
//!
//! A background task owns the WebSocket and multiplexes it across every
//! document proxy and presence channel created from the handle: outbound
//! envelopes flow through one channel drained by the task, inbound envelopes
//! are routed by `(collection, id)` to the matching registry entry. The task
//! also drives the application-level heartbeat and the exponential-backoff
//! reconnect policy, re-issuing subscribe requests after every successful
//! reconnect because server-side subscriptions do not survive a drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use rowboat_proto::{code, Action, DocKey, Envelope, SyncError};

use crate::config::ClientConfig;
use crate::doc::{Doc, DocShared};
use crate::presence::{Presence, PresenceShared};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal failure, e.g. a rejected credential. No further retries.
    Error,
}

/// Published through a watch channel for status indicators.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

pub(crate) struct ConnInner {
    pub(crate) config: ClientConfig,
    url: String,
    token: String,
    tx: mpsc::UnboundedSender<Envelope>,
    docs: Mutex<HashMap<DocKey, Arc<DocShared>>>,
    presence: Mutex<HashMap<DocKey, Arc<PresenceShared>>>,
    state_tx: watch::Sender<ConnectionState>,
    connection_id: Mutex<Option<String>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl ConnInner {
    pub(crate) fn send(&self, env: Envelope) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Destroyed);
        }
        self.tx.send(env).map_err(|_| SyncError::Destroyed)
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn connection_id(&self) -> Option<String> {
        self.connection_id.lock().clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state_tx.borrow().status == ConnectionStatus::Connected
    }

    pub(crate) fn remove_doc(&self, key: &DocKey) {
        self.docs.lock().remove(key);
    }

    fn set_state(&self, status: ConnectionStatus, attempts: u32, error: Option<String>) {
        self.state_tx.send_modify(|state| {
            state.status = status;
            state.reconnect_attempts = attempts;
            if error.is_some() {
                state.last_error = error;
            } else if status == ConnectionStatus::Connected {
                state.last_error = None;
            }
        });
    }

    fn record_error(&self, message: String) {
        self.state_tx
            .send_modify(|state| state.last_error = Some(message));
    }
}

/// Handle to the shared connection. Documents and presence channels are
/// created from it and carry it along, so there is no ambient global
/// connection anywhere.
pub struct Connection {
    inner: Arc<ConnInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Open the socket, run the authenticated handshake and start the
    /// background runtime.
    ///
    /// Returns `Unauthorized` if the server rejects the credential; that is
    /// terminal and never retried. A network failure on the first attempt is
    /// not an error: the handle is returned while still dialing and the
    /// backoff policy keeps retrying.
    pub async fn connect(
        url: impl Into<String>,
        token: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::default());
        let inner = Arc::new(ConnInner {
            config,
            url: url.into(),
            token: token.into(),
            tx,
            docs: Mutex::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            state_tx,
            connection_id: Mutex::new(None),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(run_loop(Arc::clone(&inner), rx));
        let connection = Self {
            inner,
            task: Mutex::new(Some(task)),
        };

        loop {
            if state_rx.changed().await.is_err() {
                return Err(SyncError::Destroyed);
            }
            let (status, attempts) = {
                let state = state_rx.borrow();
                (state.status, state.reconnect_attempts)
            };
            match status {
                ConnectionStatus::Connected => return Ok(connection),
                ConnectionStatus::Error => {
                    connection.close();
                    return Err(SyncError::Unauthorized);
                }
                // First dial failed for a transient reason; the runtime
                // keeps retrying in the background.
                _ if attempts > 0 => return Ok(connection),
                _ => {}
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch connection state transitions; for UI status indicators.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Server-assigned connection id, once the handshake completed.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection_id()
    }

    /// The proxy for `(collection, id)`, created on first access. All
    /// handles for the same key share one local mirror.
    pub fn doc(&self, collection: impl Into<String>, id: impl Into<String>) -> Doc {
        let key = DocKey::new(collection, id);
        let shared = Arc::clone(
            self.inner
                .docs
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(DocShared::new(key))),
        );
        Doc {
            conn: Arc::clone(&self.inner),
            shared,
        }
    }

    /// The presence channel for `(collection, id)`, created on first access.
    pub fn presence(&self, collection: impl Into<String>, id: impl Into<String>) -> Presence {
        let key = DocKey::new(collection, id);
        let shared = Arc::clone(
            self.inner
                .presence
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(PresenceShared::new(key))),
        );
        Presence {
            conn: Arc::clone(&self.inner),
            shared,
        }
    }

    /// Tear the connection down. Pending calls are rejected with
    /// `Destroyed`; reconnect timers are cancelled. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        for doc in self.inner.docs.lock().values() {
            doc.fail_pending(SyncError::Destroyed, false);
        }
        for channel in self.inner.presence.lock().values() {
            channel.fail_pending(SyncError::Destroyed);
        }
        self.inner
            .set_state(ConnectionStatus::Disconnected, 0, None);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Empty the outbound queue after a reconnect, keeping only the envelopes
/// that are safe to replay on the fresh socket. Subscription and fetch
/// requests are idempotent; anything versioned or sequenced is not.
fn drain_offline_queue(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut retained = Vec::new();
    while let Ok(env) = rx.try_recv() {
        match env.a {
            Action::Subscribe | Action::Fetch | Action::PresenceSubscribe => retained.push(env),
            _ => debug!(action = ?env.a, "discarding envelope queued while offline"),
        }
    }
    retained
}

/// Delay before reconnect attempt `attempt` (1-based): exponential from the
/// configured minimum, capped at the maximum.
pub(crate) fn backoff_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    config
        .reconnect_min_delay
        .saturating_mul(1u32 << exponent)
        .min(config.reconnect_max_delay)
}

enum EstablishError {
    Unauthorized,
    Transient(String),
}

async fn run_loop(inner: Arc<ConnInner>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    let mut attempts: u32 = 0;
    let mut ever_connected = false;

    loop {
        let dialing_status = if ever_connected {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        inner.set_state(dialing_status, attempts, None);

        match establish(&inner).await {
            Ok(ws) => {
                attempts = 0;
                ever_connected = true;
                inner.set_state(ConnectionStatus::Connected, 0, None);
                info!(url = %inner.url, "connected");

                // Envelopes queued while the socket was down: state-changing
                // submissions would apply against a stale base and are
                // dropped, but snapshot requests are idempotent and carry
                // across the reconnect.
                let retained = drain_offline_queue(&mut rx);
                resubscribe_all(&inner);
                for env in retained {
                    let _ = inner.tx.send(env);
                }

                let reason = drive(&inner, ws, &mut rx).await;
                warn!(error = %reason, "connection lost; scheduling reconnect");
                inner.record_error(reason);
                reject_inflight(&inner);
            }
            Err(EstablishError::Unauthorized) => {
                inner.set_state(
                    ConnectionStatus::Error,
                    attempts,
                    Some("credential rejected".into()),
                );
                for doc in inner.docs.lock().values() {
                    doc.fail_pending(SyncError::Unauthorized, true);
                }
                for channel in inner.presence.lock().values() {
                    channel.fail_pending(SyncError::Unauthorized);
                }
                return;
            }
            Err(EstablishError::Transient(message)) => {
                debug!(url = %inner.url, error = %message, "dial failed");
                inner.record_error(message);
            }
        }

        attempts += 1;
        let status = if ever_connected {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        inner.set_state(status, attempts, None);
        tokio::time::sleep(backoff_delay(&inner.config, attempts)).await;
    }
}

/// Dial, then run the authenticated handshake. Only an explicit rejection
/// from the server is terminal; everything else is retried.
async fn establish(inner: &Arc<ConnInner>) -> Result<WsStream, EstablishError> {
    let (mut ws, _) = connect_async(&inner.url)
        .await
        .map_err(|err| EstablishError::Transient(err.to_string()))?;

    let hello = Envelope::handshake(&inner.token)
        .encode()
        .map_err(|err| EstablishError::Transient(err.to_string()))?;
    ws.send(Message::Text(hello))
        .await
        .map_err(|err| EstablishError::Transient(err.to_string()))?;

    loop {
        let frame = timeout(inner.config.fetch_timeout, ws.next())
            .await
            .map_err(|_| EstablishError::Transient("handshake timed out".into()))?
            .ok_or_else(|| EstablishError::Transient("socket closed during handshake".into()))?
            .map_err(|err| EstablishError::Transient(err.to_string()))?;

        let Message::Text(text) = frame else { continue };
        let env = match Envelope::decode(&text) {
            Ok(env) => env,
            Err(err) => {
                return Err(EstablishError::Transient(format!(
                    "malformed handshake reply: {err}"
                )))
            }
        };
        if env.a != Action::Handshake {
            continue;
        }
        if let Some(error) = env.error {
            if error.code == code::UNAUTHORIZED {
                return Err(EstablishError::Unauthorized);
            }
            return Err(EstablishError::Transient(error.message));
        }
        *inner.connection_id.lock() = env.id;
        return Ok(ws);
    }
}

/// Pump the socket until it dies: forward outbound envelopes, route inbound
/// ones, and keep the heartbeat honest. Returns the loss reason.
async fn drive(
    inner: &Arc<ConnInner>,
    ws: WsStream,
    rx: &mut mpsc::UnboundedReceiver<Envelope>,
) -> String {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = interval(inner.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(env) = outbound else {
                    return "client handle dropped".into();
                };
                let text = match env.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode outbound envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    return "write failed".into();
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                        Ok(env) if env.a == Action::Pong => {
                            last_pong = Instant::now();
                        }
                        Ok(env) if env.a == Action::Ping => {
                            if let Ok(text) = Envelope::pong().encode() {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    return "write failed".into();
                                }
                            }
                        }
                        Ok(env) => dispatch(inner, env),
                        Err(err) => {
                            warn!(error = %err, "dropping malformed inbound frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) => return "server closed the connection".into(),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return err.to_string(),
                    None => return "socket stream ended".into(),
                }
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > inner.config.heartbeat_timeout {
                    return "heartbeat timed out".into();
                }
                let Ok(text) = Envelope::ping().encode() else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    return "write failed".into();
                }
            }
        }
    }
}

/// Route an inbound envelope to its document or presence channel.
/// Unroutable envelopes are dropped, not errored.
fn dispatch(inner: &Arc<ConnInner>, env: Envelope) {
    let local_id = inner.connection_id();
    match env.a {
        Action::Subscribe | Action::Fetch => {
            let mark_subscribed = env.a == Action::Subscribe;
            let Some(key) = env.doc_key() else { return };
            match inner.docs.lock().get(&key).cloned() {
                Some(doc) => doc.on_snapshot(env, mark_subscribed),
                None => debug!(doc = %key, "dropping snapshot with no subscriber"),
            }
        }
        Action::Op => {
            let Some(key) = env.doc_key() else { return };
            match inner.docs.lock().get(&key).cloned() {
                Some(doc) => {
                    if doc.on_op(env, local_id.as_deref()) {
                        // The mirror missed an operation; a fresh snapshot
                        // puts it back in sequence.
                        let _ = inner.tx.send(Envelope::fetch(&key));
                    }
                }
                None => debug!(doc = %key, "dropping operation with no subscriber"),
            }
        }
        Action::Presence => {
            let Some(key) = env.doc_key() else { return };
            match inner.presence.lock().get(&key).cloned() {
                Some(channel) => channel.on_presence(env, local_id.as_deref()),
                None => debug!(channel = %key, "dropping presence with no subscriber"),
            }
        }
        // Acks and verbs handled elsewhere in the runtime.
        Action::Unsubscribe
        | Action::PresenceSubscribe
        | Action::PresenceUnsubscribe
        | Action::Handshake
        | Action::Ping
        | Action::Pong => {}
    }
}

/// Server-side subscriptions do not survive a drop; re-issue them all and
/// let the fresh snapshots replace any state that drifted while offline.
fn resubscribe_all(inner: &Arc<ConnInner>) {
    let docs: Vec<Arc<DocShared>> = inner.docs.lock().values().cloned().collect();
    for doc in docs {
        if doc.is_subscribed() {
            debug!(doc = %doc.key, "resubscribing after reconnect");
            let _ = inner.tx.send(Envelope::subscribe(&doc.key));
        }
    }
    let channels: Vec<Arc<PresenceShared>> = inner.presence.lock().values().cloned().collect();
    for channel in channels {
        if channel.is_subscribed() {
            let _ = inner.tx.send(Envelope::presence_subscribe(&channel.key));
        }
    }
}

/// A submit in flight when the socket dropped must not be silently
/// resubmitted against a possibly stale base; roll it back and report
/// `ConnectionLost` so the caller decides.
fn reject_inflight(inner: &Arc<ConnInner>) {
    for doc in inner.docs.lock().values() {
        doc.fail_pending(SyncError::ConnectionLost, true);
    }
    for channel in inner.presence.lock().values() {
        channel.fail_pending(SyncError::ConnectionLost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = ClientConfig {
            reconnect_min_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            ..ClientConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 7), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 50), Duration::from_secs(30));
    }

    #[test]
    fn offline_queue_keeps_snapshot_requests_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = DocKey::new("records", "rec_1");
        tx.send(Envelope::op(
            &key,
            3,
            vec![rowboat_proto::Patch::increment(
                vec![rowboat_proto::PathSegment::from("count")],
                1.0,
            )],
            "conn_a",
            1,
        ))
        .unwrap();
        tx.send(Envelope::subscribe(&key)).unwrap();
        tx.send(Envelope::fetch(&key)).unwrap();
        tx.send(Envelope::presence_subscribe(&key)).unwrap();
        tx.send(Envelope::ping()).unwrap();

        let retained = drain_offline_queue(&mut rx);
        let actions: Vec<Action> = retained.iter().map(|env| env.a).collect();
        assert_eq!(
            actions,
            vec![Action::Subscribe, Action::Fetch, Action::PresenceSubscribe]
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn default_state_is_disconnected() {
        let state = ConnectionState::default();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.reconnect_attempts, 0);
        assert!(state.last_error.is_none());
    }
}
