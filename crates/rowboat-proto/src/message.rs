//! The wire envelope exchanged over the persistent socket.
//!
//! Every frame is one JSON envelope with a short action tag and optional
//! fields, keyed with the compact names the protocol has always used:
//! `a` action, `c` collection, `d` document id, `v` version, `op` patches,
//! `data` snapshot payload, `presence` presence payload, `src` submitting
//! connection, `seq` per-connection sequence number.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::op::Patch;

pub const PROTOCOL_VERSION: u16 = 1;

/// Action tags, one per protocol verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "hs")]
    Handshake,
    #[serde(rename = "f")]
    Fetch,
    #[serde(rename = "s")]
    Subscribe,
    #[serde(rename = "us")]
    Unsubscribe,
    #[serde(rename = "op")]
    Op,
    #[serde(rename = "p")]
    Presence,
    #[serde(rename = "ps")]
    PresenceSubscribe,
    #[serde(rename = "pu")]
    PresenceUnsubscribe,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

/// Addresses one synchronized document: a `(collection, id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.collection, self.id)
    }
}

/// Stable string codes carried inside error payloads.
pub mod code {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const VERSION_CONFLICT: &str = "VERSION_CONFLICT";
    pub const OP_INVALID: &str = "OP_INVALID";
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(code::UNAUTHORIZED, message)
    }

    pub fn version_conflict(message: impl Into<String>) -> Self {
        Self::new(code::VERSION_CONFLICT, message)
    }

    pub fn op_invalid(message: impl Into<String>) -> Self {
        Self::new(code::OP_INVALID, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(code::SERVER_ERROR, message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub a: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<Vec<Patch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
    /// Connection id of the submitting client, echoed back on acks and
    /// forwarded on broadcasts so receivers can tell their own operations
    /// from genuinely remote ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Per-connection sequence number correlating acks with submissions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Handshake: the server-assigned connection id. Presence: the
    /// publishing session id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    pub fn new(a: Action) -> Self {
        Self {
            a,
            c: None,
            d: None,
            v: None,
            op: None,
            data: None,
            error: None,
            presence: None,
            src: None,
            seq: None,
            protocol: None,
            token: None,
            id: None,
        }
    }

    fn addressed(a: Action, key: &DocKey) -> Self {
        let mut env = Self::new(a);
        env.c = Some(key.collection.clone());
        env.d = Some(key.id.clone());
        env
    }

    pub fn handshake(token: &str) -> Self {
        let mut env = Self::new(Action::Handshake);
        env.protocol = Some(PROTOCOL_VERSION);
        env.token = Some(token.to_string());
        env
    }

    pub fn handshake_reply(connection_id: &str) -> Self {
        let mut env = Self::new(Action::Handshake);
        env.protocol = Some(PROTOCOL_VERSION);
        env.id = Some(connection_id.to_string());
        env
    }

    pub fn subscribe(key: &DocKey) -> Self {
        Self::addressed(Action::Subscribe, key)
    }

    pub fn unsubscribe(key: &DocKey) -> Self {
        Self::addressed(Action::Unsubscribe, key)
    }

    pub fn fetch(key: &DocKey) -> Self {
        Self::addressed(Action::Fetch, key)
    }

    pub fn snapshot(a: Action, key: &DocKey, version: u64, data: Value) -> Self {
        let mut env = Self::addressed(a, key);
        env.v = Some(version);
        env.data = Some(data);
        env
    }

    pub fn op(key: &DocKey, base_version: u64, patches: Vec<Patch>, src: &str, seq: u64) -> Self {
        let mut env = Self::addressed(Action::Op, key);
        env.v = Some(base_version);
        env.op = Some(patches);
        env.src = Some(src.to_string());
        env.seq = Some(seq);
        env
    }

    pub fn op_ack(key: &DocKey, new_version: u64, src: &str, seq: Option<u64>) -> Self {
        let mut env = Self::addressed(Action::Op, key);
        env.v = Some(new_version);
        env.src = Some(src.to_string());
        env.seq = seq;
        env
    }

    pub fn op_broadcast(key: &DocKey, new_version: u64, patches: Vec<Patch>, src: &str) -> Self {
        let mut env = Self::addressed(Action::Op, key);
        env.v = Some(new_version);
        env.op = Some(patches);
        env.src = Some(src.to_string());
        env
    }

    pub fn reject(a: Action, key: &DocKey, seq: Option<u64>, error: ErrorPayload) -> Self {
        let mut env = Self::addressed(a, key);
        env.seq = seq;
        env.error = Some(error);
        env
    }

    pub fn presence_subscribe(key: &DocKey) -> Self {
        Self::addressed(Action::PresenceSubscribe, key)
    }

    pub fn presence_unsubscribe(key: &DocKey) -> Self {
        Self::addressed(Action::PresenceUnsubscribe, key)
    }

    /// A presence update. `payload = None` announces that the session left.
    pub fn presence_update(
        key: &DocKey,
        session_id: &str,
        payload: Option<Value>,
        src: &str,
    ) -> Self {
        let mut env = Self::addressed(Action::Presence, key);
        env.id = Some(session_id.to_string());
        env.presence = payload;
        env.src = Some(src.to_string());
        env
    }

    pub fn presence_ack(key: &DocKey, src: &str, seq: u64) -> Self {
        let mut env = Self::addressed(Action::Presence, key);
        env.src = Some(src.to_string());
        env.seq = Some(seq);
        env
    }

    pub fn ping() -> Self {
        Self::new(Action::Ping)
    }

    pub fn pong() -> Self {
        Self::new(Action::Pong)
    }

    pub fn doc_key(&self) -> Option<DocKey> {
        match (&self.c, &self.d) {
            (Some(c), Some(d)) => Some(DocKey::new(c.clone(), d.clone())),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
