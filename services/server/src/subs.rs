//! Subscription registry: bidirectional subscriber/topic indexing.
//!
//! Both indices live under one lock so every operation is atomic and the
//! cross-index invariant (`sub` listed under topic `t` exactly when `t` is in
//! `sub`'s topic list) holds after each call. Topics are lowercased and
//! trimmed before indexing; empty results are skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::ClientConnection;

pub type SubscriberId = String;

struct SubscriberEntry {
    connection: Arc<ClientConnection>,
    /// Topics in subscription order.
    topics: Vec<String>,
}

#[derive(Default)]
struct Inner {
    subs: HashMap<SubscriberId, SubscriberEntry>,
    /// topic → subscriber ids in subscription order.
    topics: HashMap<String, Vec<SubscriberId>>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

/// Lowercase and trim; `None` for topics that normalize to nothing.
pub fn normalize_topic(topic: &str) -> Option<String> {
    let topic = topic.trim().to_lowercase();
    if topic.is_empty() { None } else { Some(topic) }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    pub fn has_subscriber(&self, sub_id: &str) -> bool {
        self.inner.lock().expect("subs lock").subs.contains_key(sub_id)
    }

    /// Ensure `connection` is a subscriber and join `topics`. Returns the
    /// subset actually added.
    pub fn add_subscriber(&self, connection: Arc<ClientConnection>, topics: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock().expect("subs lock");
        let sub_id = connection.id().to_owned();
        inner
            .subs
            .entry(sub_id.clone())
            .or_insert_with(|| SubscriberEntry {
                connection,
                topics: Vec::new(),
            });
        add_topics_locked(&mut inner, &sub_id, topics)
    }

    /// Join `topics` for an existing subscriber. Returns the subset actually
    /// added; unknown subscribers add nothing.
    pub fn add_topics(&self, sub_id: &str, topics: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock().expect("subs lock");
        add_topics_locked(&mut inner, sub_id, topics)
    }

    /// Leave `topics`. Returns the subset actually removed; topics the
    /// subscriber never held are silently ignored.
    pub fn remove_topics(&self, sub_id: &str, topics: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock().expect("subs lock");
        let inner = &mut *inner;
        let mut removed = Vec::new();
        for topic in topics {
            let Some(topic) = normalize_topic(topic) else {
                continue;
            };
            let Some(entry) = inner.subs.get_mut(sub_id) else {
                continue;
            };
            let Some(position) = entry.topics.iter().position(|t| t == &topic) else {
                continue;
            };
            entry.topics.remove(position);
            detach_from_topic(&mut inner.topics, &topic, sub_id);
            removed.push(topic);
        }
        removed
    }

    /// Full teardown for one subscriber. Idempotent.
    pub fn remove_subscriber(&self, sub_id: &str) {
        let mut inner = self.inner.lock().expect("subs lock");
        let Some(entry) = inner.subs.remove(sub_id) else {
            return;
        };
        for topic in &entry.topics {
            detach_from_topic(&mut inner.topics, topic, sub_id);
        }
    }

    /// Connections subscribed to `topic`, in subscription order.
    pub fn subscribers_of(&self, topic: &str) -> Vec<Arc<ClientConnection>> {
        let Some(topic) = normalize_topic(topic) else {
            return Vec::new();
        };
        let inner = self.inner.lock().expect("subs lock");
        inner
            .topics
            .get(&topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.subs.get(id))
                    .map(|entry| Arc::clone(&entry.connection))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every topic `sub_id` currently holds, in subscription order.
    pub fn topics_of(&self, sub_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .expect("subs lock")
            .subs
            .get(sub_id)
            .map(|entry| entry.topics.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock().expect("subs lock");
        for (sub_id, entry) in &inner.subs {
            for topic in &entry.topics {
                let ids = inner.topics.get(topic).expect("topic index entry");
                assert!(ids.contains(sub_id), "{sub_id} missing under {topic}");
            }
        }
        for (topic, ids) in &inner.topics {
            for sub_id in ids {
                let entry = inner.subs.get(sub_id).expect("subscriber entry");
                assert!(
                    entry.topics.contains(topic),
                    "{topic} missing in {sub_id}'s list"
                );
            }
        }
    }
}

fn add_topics_locked(inner: &mut Inner, sub_id: &str, topics: &[String]) -> Vec<String> {
    let mut added = Vec::new();
    for topic in topics {
        let Some(topic) = normalize_topic(topic) else {
            continue;
        };
        let Some(entry) = inner.subs.get_mut(sub_id) else {
            continue;
        };
        if entry.topics.contains(&topic) {
            continue;
        }
        entry.topics.push(topic.clone());
        let ids = inner.topics.entry(topic.clone()).or_default();
        if !ids.iter().any(|id| id == sub_id) {
            ids.push(sub_id.to_owned());
        }
        added.push(topic);
    }
    added
}

fn detach_from_topic(topics: &mut HashMap<String, Vec<SubscriberId>>, topic: &str, sub_id: &str) {
    if let Some(ids) = topics.get_mut(topic) {
        ids.retain(|id| id != sub_id);
        if ids.is_empty() {
            topics.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_connection() -> Arc<ClientConnection> {
        // A real socket pair; the accept side is dropped, writes just fail.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stream, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_read, write) = stream.expect("connect").into_split();
        Arc::new(ClientConnection::from_tcp(write))
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[tokio::test]
    async fn add_and_remove_keep_both_indices_consistent() {
        let registry = SubscriptionRegistry::new();
        let conn = test_connection().await;
        let id = conn.id().to_owned();

        let added = registry.add_subscriber(Arc::clone(&conn), &topics(&["Orders", " fills "]));
        assert_eq!(added, ["orders", "fills"]);
        registry.assert_consistent();

        // Re-adding an owned topic reports nothing new.
        let added = registry.add_topics(&id, &topics(&["orders", "books"]));
        assert_eq!(added, ["books"]);
        registry.assert_consistent();

        let removed = registry.remove_topics(&id, &topics(&["orders", "never-held"]));
        assert_eq!(removed, ["orders"]);
        registry.assert_consistent();

        assert_eq!(registry.topics_of(&id), ["fills", "books"]);
    }

    #[tokio::test]
    async fn empty_topics_are_rejected_by_normalization() {
        let registry = SubscriptionRegistry::new();
        let conn = test_connection().await;
        let added = registry.add_subscriber(conn, &topics(&["", "   ", "ok"]));
        assert_eq!(added, ["ok"]);
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn subscribers_of_resolves_in_subscription_order() {
        let registry = SubscriptionRegistry::new();
        let first = test_connection().await;
        let second = test_connection().await;
        registry.add_subscriber(Arc::clone(&first), &topics(&["orders"]));
        registry.add_subscriber(Arc::clone(&second), &topics(&["ORDERS"]));

        let subscribers = registry.subscribers_of("orders");
        assert_eq!(subscribers.len(), 2);
        assert_eq!(subscribers[0].id(), first.id());
        assert_eq!(subscribers[1].id(), second.id());
        assert!(registry.subscribers_of("unknown").is_empty());
    }

    #[tokio::test]
    async fn remove_subscriber_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let conn = test_connection().await;
        let id = conn.id().to_owned();
        registry.add_subscriber(conn, &topics(&["a", "b"]));

        registry.remove_subscriber(&id);
        registry.assert_consistent();
        assert!(registry.subscribers_of("a").is_empty());

        // Second teardown is a no-op.
        registry.remove_subscriber(&id);
        registry.assert_consistent();
        assert!(!registry.has_subscriber(&id));
    }
}
