//! WebSocket session handling.
//!
//! Each socket gets a bounded outbound channel drained by a writer task, so
//! every delivery path (direct replies and hub broadcasts) goes through the
//! same flow-controlled pipe. The first frame must be an authenticated
//! handshake; everything after it is dispatched by action tag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rowboat_proto::{validate_ops, Action, DocKey, Envelope, ErrorPayload};

use crate::auth::Principal;
use crate::store::StoreError;
use crate::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Envelope>(state.config.channel_depth);

    let (conn_id, principal) = match handshake(&state, &mut sink, &mut stream).await {
        Some(outcome) => outcome,
        None => return,
    };
    info!(conn = %conn_id, subject = %principal.subject, "session established");

    let writer = tokio::spawn(write_loop(sink, rx));

    let mut session = Session {
        id: conn_id,
        state,
        tx,
        subs: HashSet::new(),
        presence_subs: HashSet::new(),
        published: HashMap::new(),
    };
    session.run(&mut stream).await;
    session.cleanup();
    writer.abort();
}

/// First frame must be an `hs` envelope carrying a valid token. Replies with
/// the assigned connection id, or an UNAUTHORIZED error before closing.
async fn handshake(
    state: &Arc<AppState>,
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
) -> Option<(String, Principal)> {
    let env = loop {
        let frame = match timeout(state.config.handshake_timeout, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(_) => return None,
            Err(_) => {
                debug!("handshake timed out");
                return None;
            }
        };
        match frame {
            Message::Text(text) => match Envelope::decode(&text) {
                Ok(env) if env.a == Action::Handshake => break env,
                Ok(env) => {
                    debug!(action = ?env.a, "frame before handshake");
                    return None;
                }
                Err(err) => {
                    debug!(error = %err, "malformed handshake frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => continue,
        }
    };

    let token = env.token.unwrap_or_default();
    match state.verifier.verify(&token) {
        Ok(principal) => {
            let conn_id = format!("conn_{}", Uuid::new_v4().simple());
            let mut reply = Envelope::handshake_reply(&conn_id);
            reply.protocol = env.protocol;
            send_direct(sink, &reply).await?;
            Some((conn_id, principal))
        }
        Err(err) => {
            warn!(error = %err, "rejecting handshake");
            let mut reply = Envelope::new(Action::Handshake);
            reply.error = Some(ErrorPayload::unauthorized(err.to_string()));
            let _ = send_direct(sink, &reply).await;
            let _ = sink.close().await;
            None
        }
    }
}

async fn send_direct(sink: &mut SplitSink<WebSocket, Message>, env: &Envelope) -> Option<()> {
    let text = env.encode().ok()?;
    sink.send(Message::Text(text)).await.ok()
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(env) = rx.recv().await {
        let text = match env.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound envelope");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

struct Session {
    id: String,
    state: Arc<AppState>,
    tx: mpsc::Sender<Envelope>,
    subs: HashSet<DocKey>,
    presence_subs: HashSet<DocKey>,
    /// Presence session ids this connection published, per channel. Needed
    /// to broadcast leave notices when the socket drops.
    published: HashMap<DocKey, HashSet<String>>,
}

impl Session {
    async fn run(&mut self, stream: &mut SplitStream<WebSocket>) {
        loop {
            let frame = match timeout(self.state.config.read_timeout, stream.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(err))) => {
                    debug!(conn = %self.id, error = %err, "read error");
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    info!(conn = %self.id, "closing silent session");
                    return;
                }
            };
            let env = match frame {
                Message::Text(text) => match Envelope::decode(&text) {
                    Ok(env) => env,
                    Err(err) => {
                        warn!(conn = %self.id, error = %err, "dropping malformed frame");
                        continue;
                    }
                },
                Message::Close(_) => return,
                _ => continue,
            };
            self.dispatch(env).await;
        }
    }

    async fn dispatch(&mut self, env: Envelope) {
        match env.a {
            Action::Ping => {
                let _ = self.tx.send(Envelope::pong()).await;
            }
            Action::Pong => {}
            Action::Subscribe => self.handle_subscribe(env).await,
            Action::Fetch => self.handle_fetch(env).await,
            Action::Unsubscribe => {
                if let Some(key) = env.doc_key() {
                    self.state.hub.unsubscribe_doc(&key, &self.id);
                    self.subs.remove(&key);
                    let _ = self.tx.send(Envelope::unsubscribe(&key)).await;
                }
            }
            Action::Op => self.handle_op(env).await,
            Action::PresenceSubscribe => self.handle_presence_subscribe(env).await,
            Action::PresenceUnsubscribe => {
                if let Some(key) = env.doc_key() {
                    self.state.hub.unsubscribe_presence(&key, &self.id);
                    self.presence_subs.remove(&key);
                }
            }
            Action::Presence => self.handle_presence(env).await,
            Action::Handshake => {
                debug!(conn = %self.id, "ignoring repeated handshake");
            }
        }
    }

    async fn handle_subscribe(&mut self, env: Envelope) {
        let Some(key) = env.doc_key() else { return };
        // Register before loading so no operation committed after the load
        // can slip past this subscriber.
        self.state
            .hub
            .subscribe_doc(&key, &self.id, self.tx.clone());
        self.subs.insert(key.clone());
        self.send_snapshot(Action::Subscribe, key).await;
    }

    async fn handle_fetch(&mut self, env: Envelope) {
        let Some(key) = env.doc_key() else { return };
        self.send_snapshot(Action::Fetch, key).await;
    }

    async fn send_snapshot(&mut self, a: Action, key: DocKey) {
        let (version, data) = match self.state.store.load(&key).await {
            Ok(Some(snapshot)) => snapshot,
            // Never-written documents present as version 0, empty object.
            Ok(None) => (0, serde_json::Value::Object(serde_json::Map::new())),
            Err(err) => {
                warn!(conn = %self.id, doc = %key, error = %err, "snapshot load failed");
                let _ = self
                    .tx
                    .send(Envelope::reject(
                        a,
                        &key,
                        None,
                        ErrorPayload::server_error(err.to_string()),
                    ))
                    .await;
                return;
            }
        };
        let _ = self
            .tx
            .send(Envelope::snapshot(a, &key, version, data))
            .await;
    }

    async fn handle_op(&mut self, env: Envelope) {
        let Some(key) = env.doc_key() else { return };
        let seq = env.seq;
        let base_version = env.v.unwrap_or(0);
        let patches = env.op.unwrap_or_default();

        if let Err(err) = validate_ops(&patches) {
            let mut reject =
                Envelope::reject(Action::Op, &key, seq, ErrorPayload::op_invalid(err.to_string()));
            reject.src = Some(self.id.clone());
            let _ = self.tx.send(reject).await;
            return;
        }

        match self
            .state
            .store
            .apply_and_persist(&key, base_version, &patches)
            .await
        {
            Ok(new_version) => {
                debug!(conn = %self.id, doc = %key, version = new_version, "operation committed");
                let _ = self
                    .tx
                    .send(Envelope::op_ack(&key, new_version, &self.id, seq))
                    .await;
                let broadcast = Envelope::op_broadcast(&key, new_version, patches, &self.id);
                self.state.hub.broadcast_doc(&key, &self.id, &broadcast);
            }
            Err(StoreError::VersionConflict { base, current }) => {
                debug!(conn = %self.id, doc = %key, base, current, "rejecting stale submission");
                let mut reject = Envelope::reject(
                    Action::Op,
                    &key,
                    seq,
                    ErrorPayload::version_conflict(format!(
                        "submitted against version {base}, current is {current}"
                    )),
                );
                reject.v = Some(current);
                reject.src = Some(self.id.clone());
                let _ = self.tx.send(reject).await;
            }
            Err(StoreError::InvalidOp(err)) => {
                let mut reject = Envelope::reject(
                    Action::Op,
                    &key,
                    seq,
                    ErrorPayload::op_invalid(err.to_string()),
                );
                reject.src = Some(self.id.clone());
                let _ = self.tx.send(reject).await;
            }
            Err(err) => {
                warn!(conn = %self.id, doc = %key, error = %err, "store failure");
                let mut reject = Envelope::reject(
                    Action::Op,
                    &key,
                    seq,
                    ErrorPayload::server_error(err.to_string()),
                );
                reject.src = Some(self.id.clone());
                let _ = self.tx.send(reject).await;
            }
        }
    }

    async fn handle_presence_subscribe(&mut self, env: Envelope) {
        let Some(key) = env.doc_key() else { return };
        let replay = self
            .state
            .hub
            .subscribe_presence(&key, &self.id, self.tx.clone());
        self.presence_subs.insert(key.clone());
        for (session_id, payload) in replay {
            let _ = self
                .tx
                .send(Envelope::presence_update(
                    &key,
                    &session_id,
                    Some(payload),
                    "server",
                ))
                .await;
        }
    }

    async fn handle_presence(&mut self, env: Envelope) {
        let Some(key) = env.doc_key() else { return };
        let Some(session_id) = env.id else {
            debug!(conn = %self.id, channel = %key, "presence update without a session id");
            return;
        };
        let payload = env.presence;
        match &payload {
            Some(_) => {
                self.published
                    .entry(key.clone())
                    .or_default()
                    .insert(session_id.clone());
            }
            None => {
                if let Some(sessions) = self.published.get_mut(&key) {
                    sessions.remove(&session_id);
                }
            }
        }
        self.state
            .hub
            .update_presence(&key, &self.id, &session_id, payload);
        if let Some(seq) = env.seq {
            let _ = self
                .tx
                .send(Envelope::presence_ack(&key, &self.id, seq))
                .await;
        }
    }

    /// Drop every registration this session holds and announce that its
    /// published presence sessions left.
    fn cleanup(&mut self) {
        info!(conn = %self.id, "session closed");
        for key in self.subs.drain() {
            self.state.hub.unsubscribe_doc(&key, &self.id);
        }
        for (key, sessions) in self.published.drain() {
            for session_id in sessions {
                self.state.hub.update_presence(&key, &self.id, &session_id, None);
            }
        }
        for key in self.presence_subs.drain() {
            self.state.hub.unsubscribe_presence(&key, &self.id);
        }
    }
}
