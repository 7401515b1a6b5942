//! Fan-out registries: which sessions are subscribed to which documents and
//! presence channels.
//!
//! Each subscriber hands the hub a clone of its bounded outbound channel.
//! Broadcasts use `try_send` so one slow consumer can never stall the rest;
//! a full channel drops the envelope and a closed one evicts the subscriber.
//! Presence channels additionally remember the latest payload per session so
//! a late joiner sees who is already there.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rowboat_proto::{DocKey, Envelope};

struct DocChannel {
    subscribers: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
}

struct PresenceChannel {
    subscribers: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
    /// session_id -> latest payload, replayed to new subscribers.
    entries: Mutex<HashMap<String, Value>>,
}

pub struct Hub {
    docs: DashMap<DocKey, Arc<DocChannel>>,
    presence: DashMap<DocKey, Arc<PresenceChannel>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            presence: DashMap::new(),
        }
    }

    pub fn subscribe_doc(&self, key: &DocKey, conn_id: &str, tx: mpsc::Sender<Envelope>) {
        let channel = Arc::clone(&self.docs.entry(key.clone()).or_insert_with(|| {
            Arc::new(DocChannel {
                subscribers: Mutex::new(HashMap::new()),
            })
        }));
        channel.subscribers.lock().insert(conn_id.to_string(), tx);
    }

    pub fn unsubscribe_doc(&self, key: &DocKey, conn_id: &str) {
        let Some(channel) = self.docs.get(key).map(|entry| Arc::clone(&entry)) else {
            return;
        };
        channel.subscribers.lock().remove(conn_id);
        if channel.subscribers.lock().is_empty() {
            // Guard against a racing resubscribe that replaced the entry.
            self.docs
                .remove_if(key, |_, existing| Arc::ptr_eq(existing, &channel));
        }
    }

    /// Deliver `env` to every document subscriber except `skip` (the
    /// submitter receives a dedicated ack instead).
    pub fn broadcast_doc(&self, key: &DocKey, skip: &str, env: &Envelope) {
        let Some(channel) = self.docs.get(key).map(|entry| Arc::clone(&entry)) else {
            return;
        };
        deliver(&channel.subscribers, key, skip, env);
    }

    /// Add a presence subscriber and return the current entries for replay.
    pub fn subscribe_presence(
        &self,
        key: &DocKey,
        conn_id: &str,
        tx: mpsc::Sender<Envelope>,
    ) -> Vec<(String, Value)> {
        let channel = Arc::clone(&self.presence.entry(key.clone()).or_insert_with(|| {
            Arc::new(PresenceChannel {
                subscribers: Mutex::new(HashMap::new()),
                entries: Mutex::new(HashMap::new()),
            })
        }));
        channel.subscribers.lock().insert(conn_id.to_string(), tx);
        let entries = channel
            .entries
            .lock()
            .iter()
            .map(|(session_id, payload)| (session_id.clone(), payload.clone()))
            .collect();
        entries
    }

    pub fn unsubscribe_presence(&self, key: &DocKey, conn_id: &str) {
        let Some(channel) = self.presence.get(key).map(|entry| Arc::clone(&entry)) else {
            return;
        };
        channel.subscribers.lock().remove(conn_id);
        if channel.subscribers.lock().is_empty() && channel.entries.lock().is_empty() {
            self.presence
                .remove_if(key, |_, existing| Arc::ptr_eq(existing, &channel));
        }
    }

    /// Record a presence update (`None` payload removes the entry) and
    /// broadcast it to every subscriber except the originator.
    pub fn update_presence(
        &self,
        key: &DocKey,
        conn_id: &str,
        session_id: &str,
        payload: Option<Value>,
    ) {
        let channel = Arc::clone(&self.presence.entry(key.clone()).or_insert_with(|| {
            Arc::new(PresenceChannel {
                subscribers: Mutex::new(HashMap::new()),
                entries: Mutex::new(HashMap::new()),
            })
        }));
        match &payload {
            Some(value) => {
                channel
                    .entries
                    .lock()
                    .insert(session_id.to_string(), value.clone());
            }
            None => {
                channel.entries.lock().remove(session_id);
            }
        }
        let env = Envelope::presence_update(key, session_id, payload, conn_id);
        deliver(&channel.subscribers, key, conn_id, &env);
    }

    #[cfg(test)]
    fn doc_subscriber_count(&self, key: &DocKey) -> usize {
        self.docs
            .get(key)
            .map(|entry| entry.subscribers.lock().len())
            .unwrap_or(0)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(
    subscribers: &Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
    key: &DocKey,
    skip: &str,
    env: &Envelope,
) {
    let mut closed = Vec::new();
    {
        let subscribers = subscribers.lock();
        for (conn_id, tx) in subscribers.iter() {
            if conn_id == skip {
                continue;
            }
            match tx.try_send(env.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    counter!(
                        "rowboat_broadcast_dropped_total",
                        1,
                        "doc" => key.to_string()
                    );
                    warn!(doc = %key, conn = %conn_id, "subscriber channel full; dropping envelope");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(conn_id.clone());
                }
            }
        }
    }
    if !closed.is_empty() {
        let mut subscribers = subscribers.lock();
        for conn_id in closed {
            debug!(doc = %key, conn = %conn_id, "evicting closed subscriber");
            subscribers.remove(&conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowboat_proto::{Patch, PathSegment};
    use serde_json::json;

    fn key() -> DocKey {
        DocKey::new("records", "rec_1")
    }

    #[tokio::test]
    async fn broadcast_skips_the_source() {
        let hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.subscribe_doc(&key(), "conn_a", tx_a);
        hub.subscribe_doc(&key(), "conn_b", tx_b);

        let env = Envelope::op_broadcast(
            &key(),
            2,
            vec![Patch::increment(vec![PathSegment::from("count")], 1.0)],
            "conn_a",
        );
        hub.broadcast_doc(&key(), "conn_a", &env);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().v, Some(2));
    }

    #[tokio::test]
    async fn closed_subscriber_is_evicted() {
        let hub = Hub::new();
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.subscribe_doc(&key(), "conn_a", tx_a);
        hub.subscribe_doc(&key(), "conn_b", tx_b);
        drop(rx_a);

        let env = Envelope::op_broadcast(&key(), 2, Vec::new(), "conn_c");
        hub.broadcast_doc(&key(), "conn_c", &env);

        assert_eq!(hub.doc_subscriber_count(&key()), 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn last_unsubscribe_drops_the_channel() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(8);
        hub.subscribe_doc(&key(), "conn_a", tx);
        hub.unsubscribe_doc(&key(), "conn_a");
        assert!(hub.docs.get(&key()).is_none());
    }

    #[tokio::test]
    async fn presence_replays_existing_entries_to_new_subscribers() {
        let hub = Hub::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        hub.subscribe_presence(&key(), "conn_a", tx_a);
        hub.update_presence(&key(), "conn_a", "sess_a", Some(json!({"cell": "B2"})));

        let (tx_b, _rx_b) = mpsc::channel(8);
        let replay = hub.subscribe_presence(&key(), "conn_b", tx_b);
        assert_eq!(replay, vec![("sess_a".to_string(), json!({"cell": "B2"}))]);
    }

    #[tokio::test]
    async fn presence_leave_removes_the_entry() {
        let hub = Hub::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.subscribe_presence(&key(), "conn_a", tx_a);
        hub.subscribe_presence(&key(), "conn_b", tx_b);

        hub.update_presence(&key(), "conn_a", "sess_a", Some(json!({"cell": "B2"})));
        hub.update_presence(&key(), "conn_a", "sess_a", None);

        let joined = rx_b.try_recv().unwrap();
        assert!(joined.presence.is_some());
        let left = rx_b.try_recv().unwrap();
        assert!(left.presence.is_none());
        assert_eq!(left.id.as_deref(), Some("sess_a"));

        let (tx_c, _rx_c) = mpsc::channel(8);
        assert!(hub.subscribe_presence(&key(), "conn_c", tx_c).is_empty());
    }
}
