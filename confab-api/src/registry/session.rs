//! Connection registry and room directory behind one synchronization point
//!
//! Room membership lives in a single directory guarded by an async mutex.
//! The lock is held across the media engine calls that create or tear down
//! a room's routing context, so concurrent joins of an unseen room id
//! create exactly one room and a leave can never race a join into a room
//! that is being destroyed.

use chrono::{DateTime, Utc};
use confab_sfu::{ClientId, MediaEngine, RoomId, SfuError, Teardown, UserId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::connection::ConnectionRegistry;
use super::error::{RegistryError, Result};
use crate::signaling::protocol::{
    ClientLeftPayload, ConsumerClosedPayload, MemberInfo, ProducerClosedPayload, Role,
    RoomSnapshot, ServerMessage,
};

struct Room {
    members: BTreeMap<ClientId, MemberInfo>,
    publishers: BTreeSet<ClientId>,
    created_at: DateTime<Utc>,
}

impl Room {
    fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            publishers: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Directory {
    rooms: HashMap<RoomId, Room>,
    /// Current room of every client that is in one
    memberships: HashMap<ClientId, RoomId>,
}

/// Where a client currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room_id: RoomId,
    pub role: Role,
}

/// Result of removing a client from its room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    /// The room became empty and was torn down
    pub room_closed: bool,
}

/// Directory-wide counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub clients: usize,
    pub rooms: usize,
    pub members: usize,
    pub total_registered: u64,
    pub dropped_messages: u64,
}

/// Explicitly constructed state store for clients and rooms
pub struct SessionRegistry {
    connections: ConnectionRegistry,
    directory: Mutex<Directory>,
    engine: Arc<MediaEngine>,
    /// 0 = unlimited
    max_clients_per_room: usize,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(engine: Arc<MediaEngine>, max_clients_per_room: usize) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            directory: Mutex::new(Directory::default()),
            engine,
            max_clients_per_room,
        }
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Register a connection; always succeeds
    pub fn register_client(
        &self,
        user_id: Option<UserId>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> ClientId {
        let client_id = self.connections.register(user_id.clone(), sender);
        debug!(
            client_id = %client_id,
            user_id = ?user_id.as_ref().map(UserId::as_str),
            "Client registered"
        );
        client_id
    }

    /// Put a client into a room, creating the room and its routing context
    /// if needed.
    ///
    /// A client already in another room leaves it first; joining the room a
    /// client is already in only updates its role and is not announced
    /// again. The joiner receives its `roomJoined` snapshot and existing
    /// members receive `clientJoined` before the directory lock is released,
    /// so no member can observe the two out of order.
    ///
    /// `user_id` is bound to an anonymous connection only once the join has
    /// gone through; a rejected join leaves the connection untouched.
    pub async fn join_room(
        &self,
        client_id: &ClientId,
        room_id: &RoomId,
        role: Role,
        user_id: Option<UserId>,
    ) -> Result<RoomSnapshot> {
        let handle = self
            .connections
            .get(client_id)
            .ok_or_else(|| RegistryError::UnknownClient(client_id.clone()))?;
        let user_id = handle.user_id.clone().or(user_id);

        let mut directory = self.directory.lock().await;
        let current = directory.memberships.get(client_id).cloned();
        let rejoin = current.as_ref() == Some(room_id);

        if let Some(room) = directory.rooms.get(room_id) {
            if !rejoin
                && self.max_clients_per_room > 0
                && room.members.len() >= self.max_clients_per_room
            {
                warn!(
                    room_id = %room_id,
                    max_clients = self.max_clients_per_room,
                    "Room is full"
                );
                return Err(RegistryError::RoomFull(room_id.clone()));
            }
        } else {
            self.engine.ensure_router(room_id).await?;
            directory.rooms.insert(room_id.clone(), Room::new());
            info!(room_id = %room_id, total_rooms = directory.rooms.len(), "Room created");
        }

        if current.is_some() && !rejoin {
            self.leave_locked(&mut directory, client_id).await;
        }

        let member = MemberInfo {
            client_id: client_id.clone(),
            user_id: user_id.clone(),
            role,
        };
        let Some(room) = directory.rooms.get_mut(room_id) else {
            return Err(RegistryError::Media(SfuError::RouterNotFound(room_id.clone())));
        };
        room.members.insert(client_id.clone(), member.clone());
        if role == Role::Publisher {
            room.publishers.insert(client_id.clone());
        } else {
            room.publishers.remove(client_id);
        }

        let snapshot = RoomSnapshot {
            room_id: room_id.clone(),
            client_id: client_id.clone(),
            role,
            members: room.members.values().cloned().collect(),
            publishers: room.publishers.iter().cloned().collect(),
            producers: self.engine.producers(room_id).await,
        };
        let others: Vec<ClientId> = room
            .members
            .keys()
            .filter(|id| *id != client_id)
            .cloned()
            .collect();
        directory
            .memberships
            .insert(client_id.clone(), room_id.clone());
        if let Some(user_id) = user_id {
            self.connections.set_user_id(client_id, user_id);
        }

        handle.send(ServerMessage::RoomJoined(snapshot.clone()));
        if !rejoin {
            for other in &others {
                self.connections
                    .send_to(other, ServerMessage::ClientJoined(member.clone()));
            }
        }

        info!(
            room_id = %room_id,
            client_id = %client_id,
            ?role,
            members = others.len() + 1,
            "Client joined room"
        );
        Ok(snapshot)
    }

    /// Remove a client from its room. `None` when it was not in one.
    pub async fn leave_room(&self, client_id: &ClientId) -> Option<Departure> {
        let mut directory = self.directory.lock().await;
        self.leave_locked(&mut directory, client_id).await
    }

    /// Leave the current room (if any) and deregister. Safe to call twice.
    pub async fn disconnect(&self, client_id: &ClientId) -> Option<Departure> {
        let mut directory = self.directory.lock().await;
        let departure = self.leave_locked(&mut directory, client_id).await;
        if self.connections.unregister(client_id).is_some() {
            info!(client_id = %client_id, "Client disconnected");
        }
        departure
    }

    async fn leave_locked(
        &self,
        directory: &mut Directory,
        client_id: &ClientId,
    ) -> Option<Departure> {
        let room_id = directory.memberships.remove(client_id)?;
        let Some(room) = directory.rooms.get_mut(&room_id) else {
            return Some(Departure {
                room_id,
                room_closed: false,
            });
        };
        room.members.remove(client_id);
        room.publishers.remove(client_id);
        let remaining: Vec<ClientId> = room.members.keys().cloned().collect();

        let teardown = self.engine.close_client(&room_id, client_id).await;
        self.notify_teardown(&remaining, &teardown);
        for member in &remaining {
            self.connections.send_to(
                member,
                ServerMessage::ClientLeft(ClientLeftPayload {
                    client_id: client_id.clone(),
                }),
            );
        }

        let room_closed = remaining.is_empty();
        if room_closed {
            if let Some(room) = directory.rooms.remove(&room_id) {
                let lifetime = Utc::now() - room.created_at;
                self.engine.close_room(&room_id).await;
                info!(
                    room_id = %room_id,
                    lifetime_secs = lifetime.num_seconds(),
                    total_rooms = directory.rooms.len(),
                    "Room closed"
                );
            }
        }

        info!(room_id = %room_id, client_id = %client_id, "Client left room");
        Some(Departure {
            room_id,
            room_closed,
        })
    }

    /// Tell room members about media objects that went away.
    ///
    /// Every member still in the room gets `producerClosed` for each
    /// producer; owners of cascaded consumers additionally get
    /// `consumerClosed`.
    pub async fn publish_teardown(&self, room_id: &RoomId, teardown: &Teardown) {
        let directory = self.directory.lock().await;
        let Some(room) = directory.rooms.get(room_id) else {
            return;
        };
        let members: Vec<ClientId> = room.members.keys().cloned().collect();
        drop(directory);
        self.notify_teardown(&members, teardown);
    }

    fn notify_teardown(&self, recipients: &[ClientId], teardown: &Teardown) {
        for producer in &teardown.producers {
            for member in recipients {
                self.connections.send_to(
                    member,
                    ServerMessage::ProducerClosed(ProducerClosedPayload {
                        producer_id: producer.producer_id.clone(),
                        client_id: producer.client_id.clone(),
                    }),
                );
            }
        }
        for consumer in &teardown.consumers {
            if recipients.contains(&consumer.client_id) {
                self.connections.send_to(
                    &consumer.client_id,
                    ServerMessage::ConsumerClosed(ConsumerClosedPayload {
                        consumer_id: consumer.consumer_id.clone(),
                        producer_id: consumer.producer_id.clone(),
                    }),
                );
            }
        }
    }

    /// Room and role of a client, resolved from the directory
    pub async fn membership(&self, client_id: &ClientId) -> Option<Membership> {
        let directory = self.directory.lock().await;
        let room_id = directory.memberships.get(client_id)?;
        let role = directory
            .rooms
            .get(room_id)?
            .members
            .get(client_id)?
            .role;
        Some(Membership {
            room_id: room_id.clone(),
            role,
        })
    }

    /// Send to every member of a room except `exclude`
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        message: &ServerMessage,
        exclude: Option<&ClientId>,
    ) -> usize {
        let directory = self.directory.lock().await;
        let Some(room) = directory.rooms.get(room_id) else {
            return 0;
        };
        room.members
            .keys()
            .filter(|id| Some(*id) != exclude)
            .filter(|id| self.connections.send_to(id, message.clone()))
            .count()
    }

    /// Forward a message to `target_id` if it shares a room with `from`
    pub async fn relay(
        &self,
        from: &ClientId,
        target_id: &ClientId,
        message: ServerMessage,
    ) -> Result<()> {
        let directory = self.directory.lock().await;
        let room_id = directory
            .memberships
            .get(from)
            .ok_or_else(|| RegistryError::NotInRoom(from.clone()))?;
        if directory.memberships.get(target_id) != Some(room_id) {
            return Err(RegistryError::NotInSameRoom(target_id.clone()));
        }
        self.connections.send_to(target_id, message);
        Ok(())
    }

    pub fn send_to(&self, client_id: &ClientId, message: ServerMessage) -> bool {
        self.connections.send_to(client_id, message)
    }

    pub async fn room_exists(&self, room_id: &RoomId) -> bool {
        self.directory.lock().await.rooms.contains_key(room_id)
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let directory = self.directory.lock().await;
        RegistryStats {
            clients: self.connections.len(),
            rooms: directory.rooms.len(),
            members: directory.memberships.len(),
            total_registered: self.connections.total_registered(),
            dropped_messages: self.connections.dropped_messages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_sfu::{LocalBackend, SfuConfig};

    fn registry() -> SessionRegistry {
        let engine = MediaEngine::new(
            Arc::new(LocalBackend::new(Default::default())),
            SfuConfig::default(),
        );
        SessionRegistry::new(engine, 2)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_join_creates_room_and_notifies_members() {
        let registry = registry();
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = registry.register_client(None, tx_a);
        let b = registry.register_client(Some(UserId::from("bob")), tx_b);
        let room = RoomId::from("demo");

        let snapshot = registry.join_room(&a, &room, Role::Publisher, None).await.unwrap();
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.publishers, vec![a.clone()]);

        let snapshot = registry.join_room(&b, &room, Role::Subscriber, None).await.unwrap();
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(snapshot.publishers, vec![a.clone()]);

        let to_a = drain(&mut rx_a);
        assert!(matches!(&to_a[0], ServerMessage::RoomJoined(_)));
        assert!(matches!(&to_a[1], ServerMessage::ClientJoined(m) if m.client_id == b));
        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
    }

    #[tokio::test]
    async fn test_room_capacity_is_enforced() {
        let registry = registry();
        let room = RoomId::from("small");
        let mut receivers = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(16);
            receivers.push(rx);
            clients.push(registry.register_client(None, tx));
        }

        registry.join_room(&clients[0], &room, Role::Subscriber, None).await.unwrap();
        registry.join_room(&clients[1], &room, Role::Subscriber, None).await.unwrap();
        let err = registry
            .join_room(&clients[2], &room, Role::Subscriber, None)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::RoomFull(room.clone()));
        assert!(registry.membership(&clients[2]).await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_join_does_not_bind_user_id() {
        let registry = registry();
        let room = RoomId::from("small");
        let mut receivers = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(16);
            receivers.push(rx);
            clients.push(registry.register_client(None, tx));
        }
        registry.join_room(&clients[0], &room, Role::Subscriber, None).await.unwrap();
        registry.join_room(&clients[1], &room, Role::Subscriber, None).await.unwrap();

        let err = registry
            .join_room(&clients[2], &room, Role::Subscriber, Some(UserId::from("mallory")))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::RoomFull(room.clone()));
        let handle = registry.connections().get(&clients[2]).unwrap();
        assert_eq!(handle.user_id, None);

        let other = RoomId::from("other");
        let snapshot = registry
            .join_room(&clients[2], &other, Role::Subscriber, Some(UserId::from("carol")))
            .await
            .unwrap();
        assert_eq!(snapshot.members[0].user_id, Some(UserId::from("carol")));
        let handle = registry.connections().get(&clients[2]).unwrap();
        assert_eq!(handle.user_id, Some(UserId::from("carol")));
    }

    #[tokio::test]
    async fn test_rejoin_is_not_announced_again() {
        let registry = registry();
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = registry.register_client(None, tx_a);
        let b = registry.register_client(None, tx_b);
        let room = RoomId::from("demo");
        registry.join_room(&a, &room, Role::Subscriber, None).await.unwrap();
        registry.join_room(&b, &room, Role::Subscriber, None).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let snapshot = registry.join_room(&b, &room, Role::Publisher, None).await.unwrap();
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(snapshot.publishers, vec![b.clone()]);

        assert!(drain(&mut rx_a).is_empty());
        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        assert!(matches!(&to_b[0], ServerMessage::RoomJoined(s) if s.role == Role::Publisher));
    }

    #[tokio::test]
    async fn test_last_leave_closes_room() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(16);
        let a = registry.register_client(None, tx);
        let room = RoomId::from("demo");

        registry.join_room(&a, &room, Role::Subscriber, None).await.unwrap();
        assert!(registry.engine.has_router(&room).await);

        let departure = registry.leave_room(&a).await.unwrap();
        assert!(departure.room_closed);
        assert!(!registry.room_exists(&room).await);
        assert!(!registry.engine.has_router(&room).await);

        // Leaving again is a no-op
        assert!(registry.leave_room(&a).await.is_none());
    }

    #[tokio::test]
    async fn test_join_other_room_leaves_current_one() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(16);
        let a = registry.register_client(None, tx);

        registry.join_room(&a, &RoomId::from("one"), Role::Subscriber, None).await.unwrap();
        registry.join_room(&a, &RoomId::from("two"), Role::Publisher, None).await.unwrap();

        assert!(!registry.room_exists(&RoomId::from("one")).await);
        assert_eq!(
            registry.membership(&a).await,
            Some(Membership {
                room_id: RoomId::from("two"),
                role: Role::Publisher,
            })
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let registry = registry();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = registry.register_client(None, tx_a);
        let b = registry.register_client(None, tx_b);
        let room = RoomId::from("demo");
        registry.join_room(&a, &room, Role::Subscriber, None).await.unwrap();
        registry.join_room(&b, &room, Role::Subscriber, None).await.unwrap();
        drain(&mut rx_b);

        assert!(registry.disconnect(&a).await.is_some());
        assert!(registry.disconnect(&a).await.is_none());

        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        assert!(matches!(&to_b[0], ServerMessage::ClientLeft(p) if p.client_id == a));
        assert_eq!(registry.get_stats().await.clients, 1);
    }

    #[tokio::test]
    async fn test_relay_requires_shared_room() {
        let registry = registry();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        let a = registry.register_client(None, tx_a);
        let b = registry.register_client(None, tx_b);
        registry.join_room(&a, &RoomId::from("one"), Role::Subscriber, None).await.unwrap();
        registry.join_room(&b, &RoomId::from("two"), Role::Subscriber, None).await.unwrap();

        let message = ServerMessage::ClientLeft(ClientLeftPayload { client_id: a.clone() });
        assert_eq!(
            registry.relay(&a, &b, message).await,
            Err(RegistryError::NotInSameRoom(b.clone()))
        );
    }
}
