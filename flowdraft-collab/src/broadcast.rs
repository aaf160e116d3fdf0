//! Topic fan-out with backpressure.
//!
//! Each topic (one per workflow, one per watched execution) owns a tokio
//! broadcast channel. Messages are shared as `Arc<ServerMessage>`, so a
//! publish is one send regardless of how many connections subscribe, and
//! each connection encodes the frame on its own task.
//!
//! A subscriber that falls more than `capacity` messages behind sees
//! `RecvError::Lagged` and must resynchronise.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::ConnRef;
use crate::protocol::ServerMessage;

/// A broadcast topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Draft operations, editor state, locks and presence of one workflow.
    Workflow(Uuid),
    /// Step lifecycle events of one execution.
    Execution(Uuid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Workflow(id) => write!(f, "workflow:{id}"),
            Topic::Execution(id) => write!(f, "execution:{id}"),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Messages lost by subscribers that lagged behind.
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Hot-path counters, updated without taking the peers lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Fan-out group for a single topic.
///
/// Every subscriber receives every message, the publisher's own
/// connection included. Filtering is the receiver's job.
pub struct BroadcastGroup {
    topic: Topic,
    sender: broadcast::Sender<Arc<ServerMessage>>,
    /// Connected peers and the user each one belongs to.
    peers: RwLock<HashMap<ConnRef, String>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many messages each subscriber may buffer before
    /// it starts lagging.
    pub fn new(topic: Topic, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            topic,
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, conn: ConnRef, user_id: impl Into<String>) -> broadcast::Receiver<Arc<ServerMessage>> {
        let mut peers = self.peers.write().await;
        peers.insert(conn, user_id.into());
        self.sender.subscribe()
    }

    /// Remove a peer, returning the user it belonged to.
    pub async fn remove_peer(&self, conn: &ConnRef) -> Option<String> {
        self.peers.write().await.remove(conn)
    }

    /// Publish to every subscriber. Returns how many received it.
    pub fn publish(&self, msg: ServerMessage) -> usize {
        self.publish_shared(Arc::new(msg))
    }

    pub fn publish_shared(&self, msg: Arc<ServerMessage>) -> usize {
        let count = self.sender.send(msg).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging subscriber skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Number of connections `user_id` has open on this topic.
    pub async fn connections_of(&self, user_id: &str) -> usize {
        self.peers.read().await.values().filter(|u| u.as_str() == user_id).count()
    }

    pub async fn has_peer(&self, conn: &ConnRef) -> bool {
        self.peers.read().await.contains_key(conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver that is not counted as a peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ServerMessage>> {
        self.sender.subscribe()
    }
}

/// Maps topics to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<Topic, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, topic: Topic) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another task may have created it between the two locks.
        if let Some(room) = rooms.get(&topic) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(topic, self.default_capacity));
        rooms.insert(topic, room.clone());
        log::debug!("Created topic {topic}");
        room
    }

    pub async fn get(&self, topic: Topic) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(&topic).cloned()
    }

    /// Drop the topic if nobody is connected to it.
    pub async fn remove_if_empty(&self, topic: Topic) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&topic) {
            if room.peer_count().await == 0 {
                rooms.remove(&topic);
                log::debug!("Removed empty topic {topic}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<Topic> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_topic() -> Topic {
        Topic::Workflow(Uuid::new_v4())
    }

    #[tokio::test]
    async fn add_and_remove_peers() {
        let group = BroadcastGroup::new(workflow_topic(), 16);
        let conn = ConnRef::new();

        let _rx = group.add_peer(conn, "alice").await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        assert_eq!(group.remove_peer(&conn).await.as_deref(), Some("alice"));
        assert_eq!(group.peer_count().await, 0);
        assert_eq!(group.remove_peer(&conn).await, None);
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_including_sender() {
        let group = BroadcastGroup::new(workflow_topic(), 16);
        let mut rx1 = group.add_peer(ConnRef::new(), "alice").await;
        let mut rx2 = group.add_peer(ConnRef::new(), "bob").await;

        let count = group.publish(ServerMessage::LockReleased { step_id: "s1".into() });
        assert_eq!(count, 2);

        for rx in [&mut rx1, &mut rx2] {
            let msg = rx.recv().await.unwrap();
            assert_eq!(*msg, ServerMessage::LockReleased { step_id: "s1".into() });
        }
    }

    #[tokio::test]
    async fn connections_are_counted_per_user() {
        let group = BroadcastGroup::new(workflow_topic(), 16);
        let tab1 = ConnRef::new();
        let _a = group.add_peer(tab1, "alice").await;
        let _b = group.add_peer(ConnRef::new(), "alice").await;
        let _c = group.add_peer(ConnRef::new(), "bob").await;

        assert_eq!(group.connections_of("alice").await, 2);
        group.remove_peer(&tab1).await;
        assert_eq!(group.connections_of("alice").await, 1);
        assert_eq!(group.connections_of("carol").await, 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_reported() {
        let group = BroadcastGroup::new(workflow_topic(), 2);
        let mut rx = group.add_peer(ConnRef::new(), "alice").await;
        for _ in 0..5 {
            group.publish(ServerMessage::Pong);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn room_manager_reuses_groups_per_topic() {
        let manager = RoomManager::new(16);
        let topic = workflow_topic();

        let a = manager.get_or_create(topic).await;
        let b = manager.get_or_create(topic).await;
        assert!(Arc::ptr_eq(&a, &b));

        let exec = Topic::Execution(Uuid::new_v4());
        let _ = manager.get_or_create(exec).await;
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.active_topics().await.contains(&exec));
        assert!(manager.get(Topic::Execution(Uuid::new_v4())).await.is_none());
    }

    #[tokio::test]
    async fn room_manager_only_removes_empty_topics() {
        let manager = RoomManager::new(16);
        let topic = workflow_topic();
        let room = manager.get_or_create(topic).await;
        let conn = ConnRef::new();
        let _rx = room.add_peer(conn, "alice").await;

        assert!(!manager.remove_if_empty(topic).await);
        room.remove_peer(&conn).await;
        assert!(manager.remove_if_empty(topic).await);
        assert_eq!(manager.room_count().await, 0);
    }

    #[test]
    fn topic_display() {
        let id = Uuid::nil();
        assert_eq!(Topic::Workflow(id).to_string(), format!("workflow:{id}"));
        assert_eq!(Topic::Execution(id).to_string(), format!("execution:{id}"));
    }
}
