//! Connection state management
//!
//! The registry is the only shared mutable state in the relay. It owns every
//! admitted connection and the topic membership index. Topic membership is
//! derived state: a topic exists only while it has members.

use crate::auth::Identity;
use crate::server::protocol::{Role, ServerEvent};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Opaque per-connection handle, assigned at accept time
pub type ConnectionId = Uuid;

/// Prefix of per-identity topics
pub const USER_TOPIC_PREFIX: &str = "user:";

/// Prefix of per-vehicle topics
pub const VEHICLE_TOPIC_PREFIX: &str = "vehicle:";

pub fn user_topic(subject_id: &str) -> String {
    format!("{}{}", USER_TOPIC_PREFIX, subject_id)
}

pub fn vehicle_topic(vehicle_id: &str) -> String {
    format!("{}{}", VEHICLE_TOPIC_PREFIX, vehicle_id)
}

/// Serialized event queued for a client
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub event: &'static str,
    pub payload: Arc<str>,
}

impl OutboundMessage {
    pub fn encode(event: &ServerEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.name(),
            payload: event.to_json()?.into(),
        })
    }
}

/// Role and vehicle declared by the latest presence event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub role: Option<Role>,
    pub vehicle_id: Option<String>,
}

/// An admitted client
pub struct Connection {
    /// Unique connection ID
    pub id: ConnectionId,
    /// Verified identity
    pub identity: Identity,
    presence: RwLock<Presence>,
    /// Topics this connection is a member of
    topics: RwLock<HashSet<String>>,
    /// Queue drained by the connection's writer task
    tx: mpsc::Sender<OutboundMessage>,
}

impl Connection {
    pub fn new(id: ConnectionId, identity: Identity, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id,
            identity,
            presence: RwLock::new(Presence::default()),
            topics: RwLock::new(HashSet::new()),
            tx,
        }
    }

    pub fn subject_id(&self) -> &str {
        self.identity.subject_id()
    }

    pub fn presence(&self) -> Presence {
        self.presence.read().clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.presence.read().role
    }

    pub fn vehicle_id(&self) -> Option<String> {
        self.presence.read().vehicle_id.clone()
    }

    pub fn topics(&self) -> HashSet<String> {
        self.topics.read().clone()
    }

    pub fn is_member(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }

    /// Queue a message without waiting; fails if the queue is full or closed
    pub fn send(&self, msg: OutboundMessage) -> Result<(), TrySendError<OutboundMessage>> {
        self.tx.try_send(msg)
    }
}

/// Manages all admitted connections and their topic memberships
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// All admitted connections by ID
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    /// Index: topic -> member connection IDs
    topics: Arc<DashMap<String, HashSet<ConnectionId>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly authenticated connection
    ///
    /// Idempotent per ID: a second admit returns the existing record.
    pub fn admit(
        &self,
        id: ConnectionId,
        identity: Identity,
        tx: mpsc::Sender<OutboundMessage>,
    ) -> Arc<Connection> {
        self.connections
            .entry(id)
            .or_insert_with(|| Arc::new(Connection::new(id, identity, tx)))
            .clone()
    }

    /// Apply a presence declaration
    ///
    /// Drivers with a vehicle join `vehicle:<id>`; everyone joins
    /// `user:<subject>`. Returns false if the connection is unknown.
    pub fn set_presence(
        &self,
        id: ConnectionId,
        role: Option<Role>,
        vehicle_id: Option<String>,
    ) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };

        {
            let mut presence = conn.presence.write();
            presence.role = role;
            presence.vehicle_id = vehicle_id.clone();
        }

        if role == Some(Role::Driver) {
            if let Some(vehicle_id) = vehicle_id.as_deref() {
                self.join_topic(id, &vehicle_topic(vehicle_id));
            }
        }
        self.join_topic(id, &user_topic(conn.subject_id()));

        true
    }

    /// Add a connection to a topic
    ///
    /// Returns true only if membership changed. Empty topic names and unknown
    /// connections are ignored.
    pub fn join_topic(&self, id: ConnectionId, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }
        let Some(conn) = self.get(id) else {
            return false;
        };

        let mut topics = conn.topics.write();

        // remove() unregisters before draining topics; re-check under the lock
        if !self.connections.contains_key(&id) {
            return false;
        }
        if !topics.insert(topic.to_string()) {
            return false;
        }

        self.topics.entry(topic.to_string()).or_default().insert(id);
        true
    }

    /// Remove a connection and release all its topic memberships
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(&id)?;

        let topics = std::mem::take(&mut *conn.topics.write());
        for topic in &topics {
            self.release(topic, id);
        }

        Some(conn)
    }

    fn release(&self, topic: &str, id: ConnectionId) {
        if let Some(mut members) = self.topics.get_mut(topic) {
            members.remove(&id);
        }
        self.topics.remove_if(topic, |_, members| members.is_empty());
    }

    /// Get a connection by ID
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Snapshot of every admitted connection
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of the current members of a topic
    pub fn members(&self, topic: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.topics.get(topic) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };

        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|members| members.len()).unwrap_or(0)
    }

    /// Topics held by a connection (empty if unknown)
    pub fn topics_of(&self, id: ConnectionId) -> HashSet<String> {
        self.get(id).map(|conn| conn.topics()).unwrap_or_default()
    }

    /// Get total connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of topics with at least one member
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admit(registry: &ConnectionRegistry, subject: &str) -> (ConnectionId, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(10);
        let id = Uuid::new_v4();
        registry.admit(id, Identity::new(subject), tx);
        (id, rx)
    }

    #[test]
    fn test_admit_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(10);
        let id = Uuid::new_v4();

        registry.admit(id, Identity::new("u1"), tx.clone());
        let again = registry.admit(id, Identity::new("u2"), tx);

        assert_eq!(registry.count(), 1);
        assert_eq!(again.subject_id(), "u1");
    }

    #[test]
    fn test_driver_presence_joins_vehicle_and_user() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admit(&registry, "u1");

        assert!(registry.set_presence(id, Some(Role::Driver), Some("v1".to_string())));

        let topics = registry.topics_of(id);
        assert!(topics.contains("vehicle:v1"));
        assert!(topics.contains("user:u1"));
        assert_eq!(registry.member_count("vehicle:v1"), 1);

        let conn = registry.get(id).unwrap();
        assert_eq!(conn.role(), Some(Role::Driver));
        assert_eq!(conn.vehicle_id().as_deref(), Some("v1"));
    }

    #[test]
    fn test_rider_presence_joins_user_only() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admit(&registry, "u2");

        registry.set_presence(id, Some(Role::Rider), Some("v1".to_string()));

        let topics = registry.topics_of(id);
        assert_eq!(topics.len(), 1);
        assert!(topics.contains("user:u2"));
        assert_eq!(registry.member_count("vehicle:v1"), 0);
    }

    #[test]
    fn test_shared_identity_keeps_every_connection_in_user_topic() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = admit(&registry, "u1");
        let (second, _rx2) = admit(&registry, "u1");

        registry.set_presence(first, Some(Role::Rider), None);
        registry.set_presence(second, Some(Role::Rider), None);

        assert_eq!(registry.member_count("user:u1"), 2);
        assert!(registry.topics_of(first).contains("user:u1"));

        registry.remove(second);
        assert_eq!(registry.member_count("user:u1"), 1);
    }

    #[test]
    fn test_join_topic_set_semantics() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admit(&registry, "u1");

        assert!(registry.join_topic(id, "vehicle:v1"));
        assert!(!registry.join_topic(id, "vehicle:v1"));
        assert_eq!(registry.member_count("vehicle:v1"), 1);
        assert_eq!(registry.topics_of(id).len(), 1);
    }

    #[test]
    fn test_join_empty_topic_is_noop() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admit(&registry, "u1");

        assert!(!registry.join_topic(id, ""));
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_remove_releases_topics() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = admit(&registry, "u1");
        let (b, _rx_b) = admit(&registry, "u2");

        registry.join_topic(a, "vehicle:v1");
        registry.join_topic(b, "vehicle:v1");
        registry.join_topic(a, "vehicle:v2");

        let removed = registry.remove(a).unwrap();
        assert_eq!(removed.id, a);
        assert!(removed.topics().is_empty());

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.member_count("vehicle:v1"), 1);
        // Empty topics are not retained
        assert_eq!(registry.member_count("vehicle:v2"), 0);
        assert_eq!(registry.topic_count(), 1);
    }

    #[test]
    fn test_unknown_connection_is_silent_noop() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = admit(&registry, "u1");
        registry.remove(id);

        // Must not resurrect state
        assert!(!registry.set_presence(id, Some(Role::Driver), Some("v1".to_string())));
        assert!(!registry.join_topic(id, "vehicle:v1"));
        assert!(registry.remove(id).is_none());
        assert!(registry.get(id).is_none());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_members_snapshot() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = admit(&registry, "u1");
        let (b, _rx_b) = admit(&registry, "u2");
        let (_c, _rx_c) = admit(&registry, "u3");

        registry.join_topic(a, "vehicle:v1");
        registry.join_topic(b, "vehicle:v1");

        let mut members: Vec<_> = registry.members("vehicle:v1").iter().map(|c| c.id).collect();
        members.sort();
        let mut expected = vec![a, b];
        expected.sort();

        assert_eq!(members, expected);
        assert!(registry.members("vehicle:nobody").is_empty());
        assert_eq!(registry.all().len(), 3);
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(user_topic("u1"), "user:u1");
        assert_eq!(vehicle_topic("v1"), "vehicle:v1");
    }
}
