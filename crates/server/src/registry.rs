//! Live connection registry: the single source of truth for presence. Maps
//! each user to at most one connection; a later socket from the same user
//! supersedes the earlier one.

use chrono::{DateTime, Utc};
use flux_proto::signal::ServerMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

/// Commands consumed by a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    /// Close the socket with the given code and reason, then stop writing.
    Close(u16, &'static str),
}

pub struct ConnectionEntry {
    pub user_id: String,
    pub email: String,
    pub handle: String,
    pub sender: mpsc::Sender<Outbound>,
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
}

/// Identity fields of a live peer, cloned out of the registry lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub user_id: String,
    pub email: String,
    pub handle: String,
}

#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    next_connection_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Installs the entry, returning any superseded predecessor. The caller
    /// closes the predecessor's socket; the registry never awaits a send
    /// while holding the lock.
    pub async fn register(&self, entry: ConnectionEntry) -> Option<ConnectionEntry> {
        let mut connections = self.connections.write().await;
        let previous = connections.remove(&entry.user_id);
        connections.insert(entry.user_id.clone(), entry);
        previous
    }

    /// Removes the user's entry only if it still belongs to the given
    /// connection, so a superseded socket's cleanup cannot evict its
    /// successor.
    pub async fn unregister(&self, user_id: &str, connection_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(entry) if entry.connection_id == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn sender_for(&self, user_id: &str) -> Option<mpsc::Sender<Outbound>> {
        let connections = self.connections.read().await;
        connections.get(user_id).map(|entry| entry.sender.clone())
    }

    pub async fn peer_view(&self, user_id: &str) -> Option<PeerView> {
        let connections = self.connections.read().await;
        connections.get(user_id).map(|entry| PeerView {
            user_id: entry.user_id.clone(),
            email: entry.email.clone(),
            handle: entry.handle.clone(),
        })
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let connections = self.connections.read().await;
        connections.contains_key(user_id)
    }

    pub async fn online_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }
}
