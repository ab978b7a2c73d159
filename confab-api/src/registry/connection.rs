use chrono::{DateTime, Utc};
use confab_sfu::{ClientId, UserId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::signaling::protocol::ServerMessage;

/// One live signaling connection
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub client_id: ClientId,
    pub user_id: Option<UserId>,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<ServerMessage>,
}

impl ClientHandle {
    /// Queue a message without waiting.
    ///
    /// Returns `false` when the queue is full (the message is dropped) or
    /// the writer side has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(
                    client_id = %self.client_id,
                    message_type = message.kind(),
                    "Outbound queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client_id = %self.client_id, "Outbound queue closed");
                false
            }
        }
    }
}

/// Tracks every live connection and its outbound queue
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, ClientHandle>,
    total_registered: AtomicU64,
    dropped_messages: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            total_registered: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Register a connection under a fresh id
    pub fn register(
        &self,
        user_id: Option<UserId>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> ClientId {
        let client_id = ClientId::generate();
        self.clients.insert(
            client_id.clone(),
            ClientHandle {
                client_id: client_id.clone(),
                user_id,
                connected_at: Utc::now(),
                sender,
            },
        );
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        client_id
    }

    pub fn unregister(&self, client_id: &ClientId) -> Option<ClientHandle> {
        self.clients.remove(client_id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, client_id: &ClientId) -> Option<ClientHandle> {
        self.clients.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Attach a user id to a connection that connected anonymously
    pub fn set_user_id(&self, client_id: &ClientId, user_id: UserId) {
        if let Some(mut entry) = self.clients.get_mut(client_id) {
            if entry.user_id.is_none() {
                entry.user_id = Some(user_id);
            }
        }
    }

    /// Send to one client. Unknown clients are ignored.
    pub fn send_to(&self, client_id: &ClientId, message: ServerMessage) -> bool {
        let Some(handle) = self.get(client_id) else {
            debug!(client_id = %client_id, "Dropping message for unknown client");
            return false;
        };
        let sent = handle.send(message);
        if !sent {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[must_use]
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ClientLeftPayload;

    fn left(id: &str) -> ServerMessage {
        ServerMessage::ClientLeft(ClientLeftPayload {
            client_id: ClientId::from(id),
        })
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);

        let a = registry.register(None, tx.clone());
        let b = registry.register(Some(UserId::from("bob")), tx);

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&b).unwrap().user_id, Some(UserId::from("bob")));
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = registry.register(None, tx);

        assert!(registry.send_to(&id, left("x")));
        assert!(!registry.send_to(&id, left("y")));
        assert_eq!(registry.dropped_messages(), 1);
        assert_eq!(rx.try_recv().unwrap(), left("x"));
    }

    #[test]
    fn test_set_user_id_does_not_overwrite() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.register(Some(UserId::from("alice")), tx);

        registry.set_user_id(&id, UserId::from("mallory"));
        assert_eq!(registry.get(&id).unwrap().user_id, Some(UserId::from("alice")));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.register(None, tx);

        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(!registry.send_to(&id, left("x")));
    }
}
