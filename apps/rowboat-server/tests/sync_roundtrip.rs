//! End-to-end tests running the real server against the client runtime.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use rowboat_client::{ClientConfig, Connection, ConnectionStatus, SyncError};
use rowboat_proto::{Action, DocKey, Envelope, Patch, PathSegment};
use rowboat_server::{
    app,
    auth::SharedSecretVerifier,
    config::Config,
    store::{DocumentStore, MemoryStore},
    AppState,
};

const SECRET: &str = "test-secret";
const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ClientConfig {
    ClientConfig {
        reconnect_min_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(10),
        heartbeat_timeout: Duration::from_secs(20),
        fetch_timeout: Duration::from_secs(2),
        submit_timeout: Duration::from_secs(2),
    }
}

async fn start_server() -> (String, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let verifier = Arc::new(SharedSecretVerifier::new(SECRET));
    let state = Arc::new(AppState::new(
        Config::default(),
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        verifier,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    (format!("ws://{addr}/ws"), store)
}

#[tokio::test]
async fn submit_acks_self_and_broadcasts_to_peers() {
    let (url, store) = start_server().await;
    let key = DocKey::new("records", "rec_1");
    store.seed(key.clone(), 3, json!({"name": "Alice"})).await;

    let a = Connection::connect(&url, SECRET, fast_config()).await.unwrap();
    let b = Connection::connect(&url, SECRET, fast_config()).await.unwrap();

    let doc_a = a.doc("records", "rec_1");
    let snapshot = doc_a.subscribe().await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.data, json!({"name": "Alice"}));

    let doc_b = b.doc("records", "rec_1");
    doc_b.subscribe().await.unwrap();
    let mut events_b = doc_b.events();

    let version = doc_a
        .submit(vec![Patch::insert(
            vec![PathSegment::from("name")],
            "Bob",
            Some(json!("Alice")),
        )])
        .await
        .unwrap();
    assert_eq!(version, 4);
    assert_eq!(doc_a.data(), json!({"name": "Bob"}));
    assert_eq!(doc_a.version(), 4);

    let event = timeout(WAIT, events_b.recv()).await.unwrap().unwrap();
    assert!(!event.local);
    assert_eq!(doc_b.data(), json!({"name": "Bob"}));
    assert_eq!(doc_b.version(), 4);
}

#[tokio::test]
async fn stale_submission_conflicts_and_rolls_back() {
    let (url, store) = start_server().await;
    let key = DocKey::new("records", "rec_2");
    store.seed(key.clone(), 4, json!({"count": 10})).await;

    let conn = Connection::connect(&url, SECRET, fast_config()).await.unwrap();
    let doc = conn.doc("records", "rec_2");
    let snapshot = doc.subscribe().await.unwrap();
    assert_eq!(snapshot.version, 4);

    // A writer on another surface advances the document past the mirror.
    store
        .apply_and_persist(
            &key,
            4,
            &[Patch::increment(vec![PathSegment::from("count")], 5.0)],
        )
        .await
        .unwrap();

    let err = doc
        .submit(vec![Patch::increment(vec![PathSegment::from("count")], 1.0)])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SyncError::VersionConflict {
            submitted: 4,
            current: 5
        }
    );
    // The optimistic increment is undone; the mirror shows pre-submit state.
    assert_eq!(doc.data(), json!({"count": 10}));

    let fresh = doc.fetch().await.unwrap();
    assert_eq!(fresh.version, 5);
    assert_eq!(fresh.data, json!({"count": 15}));
}

#[tokio::test]
async fn acknowledged_echo_is_not_applied_twice() {
    let (url, store) = start_server().await;
    let key = DocKey::new("records", "rec_3");
    store.seed(key.clone(), 1, json!({"count": 10})).await;

    let conn = Connection::connect(&url, SECRET, fast_config()).await.unwrap();
    let doc = conn.doc("records", "rec_3");
    doc.subscribe().await.unwrap();

    let version = doc
        .submit(vec![Patch::increment(vec![PathSegment::from("count")], 1.0)])
        .await
        .unwrap();
    assert_eq!(version, 2);
    // The ack resolved, so the echo has been processed. 11, never 12.
    assert_eq!(doc.data(), json!({"count": 11}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(doc.data(), json!({"count": 11}));
}

#[tokio::test]
async fn rejected_credential_is_terminal() {
    let (url, _store) = start_server().await;
    let err = Connection::connect(&url, "wrong-secret", fast_config())
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::Unauthorized);
}

#[tokio::test]
async fn presence_flows_between_clients_and_leaves_on_disconnect() {
    let (url, _store) = start_server().await;

    let a = Connection::connect(&url, SECRET, fast_config()).await.unwrap();
    let presence_a = a.presence("records", "rec_4");
    presence_a.subscribe().await.unwrap();
    let mut events_a = presence_a.events();

    let b = Connection::connect(&url, SECRET, fast_config()).await.unwrap();
    let presence_b = b.presence("records", "rec_4");
    presence_b.subscribe().await.unwrap();
    let local_b = presence_b.local("sess_b");
    local_b.submit(json!({"cell": "B2"})).await.unwrap();

    let joined = timeout(WAIT, events_a.recv()).await.unwrap().unwrap();
    assert_eq!(joined.session_id, "sess_b");
    assert_eq!(joined.payload, Some(json!({"cell": "B2"})));

    // Dropping the socket must announce the session's departure.
    b.close();
    drop(b);
    let left = timeout(WAIT, events_a.recv()).await.unwrap().unwrap();
    assert_eq!(left.session_id, "sess_b");
    assert_eq!(left.payload, None);
}

// A server that completes the handshake but never answers anything else.
// Used to observe client-side timeout behavior.
async fn run_stub(
    listener: TcpListener,
    answer_pings: bool,
    subscribes: mpsc::UnboundedSender<(usize, Envelope)>,
) {
    let mut conn_index = 0usize;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        conn_index += 1;
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };
        let subscribes = subscribes.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = ws.next().await {
                let Message::Text(text) = frame else { continue };
                let Ok(env) = Envelope::decode(&text) else { continue };
                match env.a {
                    Action::Handshake => {
                        let reply = Envelope::handshake_reply(&format!("conn_stub_{conn_index}"));
                        if ws
                            .send(Message::Text(reply.encode().unwrap()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Action::Ping if answer_pings => {
                        if ws
                            .send(Message::Text(Envelope::pong().encode().unwrap()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Action::Subscribe => {
                        let _ = subscribes.send((conn_index, env));
                    }
                    _ => {}
                }
            }
        });
    }
}

#[tokio::test]
async fn silent_subscribe_times_out_into_an_empty_document() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (subs_tx, _subs_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_stub(listener, true, subs_tx));

    let mut config = fast_config();
    config.fetch_timeout = Duration::from_millis(200);
    let conn = Connection::connect(format!("ws://{addr}/ws"), SECRET, config)
        .await
        .unwrap();

    let doc = conn.doc("records", "rec_new");
    let snapshot = doc.subscribe().await.unwrap();
    assert_eq!(snapshot.version, 0);
    assert_eq!(snapshot.data, json!({}));
    assert!(doc.is_subscribed());

    // Edits against the fresh document still work locally.
    assert!(doc.version() == 0);
}

#[tokio::test]
async fn missed_heartbeats_force_a_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (subs_tx, _subs_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_stub(listener, false, subs_tx));

    let mut config = fast_config();
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_timeout = Duration::from_millis(250);
    let conn = Connection::connect(format!("ws://{addr}/ws"), SECRET, config)
        .await
        .unwrap();

    let mut state = conn.watch_state();
    let reconnecting = timeout(WAIT, async {
        loop {
            if state.borrow().status == ConnectionStatus::Reconnecting {
                return;
            }
            if state.changed().await.is_err() {
                panic!("state channel closed");
            }
        }
    })
    .await;
    assert!(reconnecting.is_ok(), "client never noticed the dead link");
}

// A stateful stub for the reconnect path: the first connection is dropped
// right after it subscribes, the second serves a fresh snapshot.
async fn run_reconnect_stub(listener: TcpListener) {
    for conn_index in 1usize.. {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };
        let key = DocKey::new("records", "rec_r");
        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let Ok(env) = Envelope::decode(&text) else { continue };
            match env.a {
                Action::Handshake => {
                    let reply = Envelope::handshake_reply(&format!("conn_stub_{conn_index}"));
                    if ws
                        .send(Message::Text(reply.encode().unwrap()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Action::Ping => {
                    if ws
                        .send(Message::Text(Envelope::pong().encode().unwrap()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Action::Subscribe if conn_index == 1 => {
                    let snapshot =
                        Envelope::snapshot(Action::Subscribe, &key, 3, json!({"name": "Alice"}));
                    let _ = ws.send(Message::Text(snapshot.encode().unwrap())).await;
                    // Simulate the server dying mid-session.
                    break;
                }
                Action::Subscribe => {
                    let snapshot =
                        Envelope::snapshot(Action::Subscribe, &key, 7, json!({"name": "Carol"}));
                    let _ = ws.send(Message::Text(snapshot.encode().unwrap())).await;
                }
                _ => {}
            }
        }
        if conn_index >= 2 {
            // Keep the second connection's socket open until the test ends.
            std::future::pending::<()>().await;
        }
    }
}

// First connection dies right after the handshake; later ones speak the
// full protocol. Exercises requests issued while the socket is down.
async fn run_brief_first_connection_stub(listener: TcpListener) {
    for conn_index in 1usize.. {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };
        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let Ok(env) = Envelope::decode(&text) else { continue };
            match env.a {
                Action::Handshake => {
                    let reply = Envelope::handshake_reply(&format!("conn_stub_{conn_index}"));
                    if ws
                        .send(Message::Text(reply.encode().unwrap()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if conn_index == 1 {
                        break;
                    }
                }
                Action::Ping => {
                    let _ = ws
                        .send(Message::Text(Envelope::pong().encode().unwrap()))
                        .await;
                }
                Action::Subscribe => {
                    let key = env.doc_key().unwrap();
                    let snapshot =
                        Envelope::snapshot(Action::Subscribe, &key, 7, json!({"name": "Carol"}));
                    let _ = ws.send(Message::Text(snapshot.encode().unwrap())).await;
                }
                _ => {}
            }
        }
        if conn_index >= 2 {
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::test]
async fn subscribe_issued_while_offline_survives_the_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_brief_first_connection_stub(listener));

    let conn = Connection::connect(format!("ws://{addr}/ws"), SECRET, fast_config())
        .await
        .unwrap();

    // Wait for the first connection to die so the subscribe is queued
    // against a downed socket.
    let mut state = conn.watch_state();
    timeout(WAIT, async {
        loop {
            if state.borrow().status == ConnectionStatus::Reconnecting {
                return;
            }
            if state.changed().await.is_err() {
                panic!("state channel closed");
            }
        }
    })
    .await
    .expect("first connection never dropped");

    let doc = conn.doc("records", "rec_offline");
    let snapshot = timeout(WAIT, doc.subscribe())
        .await
        .expect("subscribe never resolved")
        .unwrap();
    assert_eq!(snapshot.version, 7, "queued subscribe must reach the new socket");
    assert_eq!(snapshot.data, json!({"name": "Carol"}));
    assert!(doc.is_subscribed());
}

#[tokio::test]
async fn reconnect_resubscribes_and_resets_backoff() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_reconnect_stub(listener));

    let conn = Connection::connect(format!("ws://{addr}/ws"), SECRET, fast_config())
        .await
        .unwrap();
    let doc = conn.doc("records", "rec_r");
    let snapshot = doc.subscribe().await.unwrap();
    assert_eq!(snapshot.version, 3);

    // The stub drops the socket after the snapshot; wait out the full
    // reconnect: down, dial, handshake, automatic resubscribe.
    let mut state = conn.watch_state();
    timeout(WAIT, async {
        let mut saw_down = false;
        loop {
            {
                let current = state.borrow();
                match current.status {
                    ConnectionStatus::Reconnecting => saw_down = true,
                    ConnectionStatus::Connected if saw_down => {
                        assert_eq!(current.reconnect_attempts, 0);
                        return;
                    }
                    _ => {}
                }
            }
            if state.changed().await.is_err() {
                panic!("state channel closed");
            }
        }
    })
    .await
    .expect("client never reconnected");

    // The resubscription snapshot replaces the stale mirror.
    timeout(WAIT, async {
        loop {
            if doc.version() == 7 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("resubscription snapshot never arrived");
    assert_eq!(doc.data(), json!({"name": "Carol"}));
}
