// src/relay/registry.rs

//! Connection registry: which WebSocket connection listens to which topics.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::events::{Event, Topic};
use crate::types::UserId;

pub type ConnectionId = u64;

struct Connection {
    topics: HashSet<Topic>,
    tx: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
}

/// Snapshot returned by `GET /ws/stats` and the `connection_stats` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub global_subscribers: usize,
    pub user_subscribers: BTreeMap<UserId, usize>,
    pub workflow_subscribers: BTreeMap<String, usize>,
    pub user_workflow_subscribers: usize,
    pub oldest_connection: Option<DateTime<Utc>>,
}

/// Lock-guarded map `connection id -> (topics, outbound queue)`.
///
/// The lock is only held for map operations and non-blocking sends.
pub struct Registry {
    inner: Mutex<Inner>,
    client_queue: usize,
}

impl Registry {
    pub fn new(client_queue: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            client_queue: client_queue.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a connection. The receiver yields serialized messages for it.
    pub fn add(&self, topics: impl IntoIterator<Item = Topic>) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.client_queue);
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.connections.insert(
            id,
            Connection {
                topics: topics.into_iter().collect(),
                tx,
                connected_at: Utc::now(),
            },
        );
        debug!(connection = id, "websocket connection registered");
        (id, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.lock().connections.remove(&id).is_some();
        if removed {
            debug!(connection = id, "websocket connection deregistered");
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a topic to a connection. Returns `false` for unknown connections.
    pub fn subscribe(&self, id: ConnectionId, topic: Topic) -> bool {
        match self.lock().connections.get_mut(&id) {
            Some(conn) => {
                conn.topics.insert(topic);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, id: ConnectionId, topic: &Topic) -> bool {
        match self.lock().connections.get_mut(&id) {
            Some(conn) => conn.topics.remove(topic),
            None => false,
        }
    }

    pub fn topics(&self, id: ConnectionId) -> Vec<Topic> {
        self.lock()
            .connections
            .get(&id)
            .map(|conn| conn.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue `event` for every connection subscribed to a matching topic.
    ///
    /// A connection whose queue is full or closed is deregistered. Returns the
    /// number of connections the event was queued for.
    pub fn broadcast(&self, event: &Event) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(kind = %event.kind, error = %err, "event could not be serialized");
                return 0;
            }
        };

        let mut inner = self.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, conn) in inner.connections.iter() {
            if !conn.topics.iter().any(|topic| event.matches(topic)) {
                continue;
            }
            match conn.tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = id, "client queue full; dropping connection");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        for id in dead {
            inner.connections.remove(&id);
        }
        delivered
    }

    /// Queue a direct reply for one connection.
    pub fn send_to(&self, id: ConnectionId, message: String) -> bool {
        let mut inner = self.lock();
        let Some(conn) = inner.connections.get(&id) else {
            return false;
        };
        match conn.tx.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                inner.connections.remove(&id);
                false
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        let mut stats = RegistryStats {
            total_connections: inner.connections.len(),
            ..RegistryStats::default()
        };

        for conn in inner.connections.values() {
            stats.oldest_connection = match stats.oldest_connection {
                Some(oldest) if oldest <= conn.connected_at => Some(oldest),
                _ => Some(conn.connected_at),
            };
            for topic in &conn.topics {
                match topic {
                    Topic::Global => stats.global_subscribers += 1,
                    Topic::User { user_id } => {
                        *stats.user_subscribers.entry(*user_id).or_default() += 1
                    }
                    Topic::Workflow { workflow_id } => {
                        *stats
                            .workflow_subscribers
                            .entry(workflow_id.clone())
                            .or_default() += 1
                    }
                    Topic::UserWorkflow { .. } => stats.user_workflow_subscribers += 1,
                }
            }
        }
        stats
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn workflow(id: &str) -> Topic {
        Topic::Workflow {
            workflow_id: id.to_string(),
        }
    }

    #[test]
    fn broadcast_respects_topics() {
        let registry = Registry::new(8);
        let (_g, mut global_rx) = registry.add([Topic::Global]);
        let (_a, mut a_rx) = registry.add([workflow("a")]);
        let (_b, mut b_rx) = registry.add([workflow("b")]);

        let delivered =
            registry.broadcast(&Event::new(EventKind::WorkflowTriggered, "queued").workflow("a"));

        assert_eq!(delivered, 2);
        assert!(global_rx.try_recv().is_ok());
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_the_connection() {
        let registry = Registry::new(1);
        let (id, _rx) = registry.add([Topic::Global]);

        let ev = Event::new(EventKind::WorkflowTriggered, "queued");
        assert_eq!(registry.broadcast(&ev), 1);
        assert_eq!(registry.broadcast(&ev), 0);
        assert!(!registry.contains(id));
    }

    #[test]
    fn closed_receiver_is_deregistered() {
        let registry = Registry::new(4);
        let (id, rx) = registry.add([Topic::Global]);
        drop(rx);
        registry.broadcast(&Event::new(EventKind::TaskFailed, "failed"));
        assert!(registry.is_empty());
        assert!(!registry.send_to(id, "x".to_string()));
    }

    #[test]
    fn subscribe_and_stats() {
        let registry = Registry::new(4);
        let (id, _rx) = registry.add([Topic::User { user_id: 3 }]);
        assert!(registry.subscribe(id, workflow("a")));
        assert!(!registry.subscribe(999, workflow("a")));

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.user_subscribers.get(&3), Some(&1));
        assert_eq!(stats.workflow_subscribers.get("a"), Some(&1));

        assert!(registry.unsubscribe(id, &workflow("a")));
        assert!(registry.stats().workflow_subscribers.is_empty());
    }
}
