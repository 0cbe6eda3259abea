//! Registry of identified neighbor connections, keyed by peer identity.
//!
//! The registry is owned by the peer actor and only ever touched from the actor task, so it needs no locking.
//! It never holds two live entries for the same identity, and never holds a connection to the local peer itself.

use std::collections::{hash_map::Keys, HashMap};

use tracing::{error, warn};

use crate::{
    message::Message,
    peer::{Connection, PeerId},
};

/// Outcome of [`ConnectionRegistry::add`].
#[must_use = "rejected connections must be closed by the caller"]
#[derive(Debug)]
pub enum Registration {
    /// The connection was registered.
    Added,
    /// The connection identifies as the local peer. The caller must close it.
    SelfConnection,
    /// Another connection is already registered for the same identity.
    Duplicate,
    /// The connection has not completed its handshake yet.
    Unidentified,
}

/// Live, identified connections of the local peer.
#[derive(Debug)]
pub struct ConnectionRegistry {
    local: PeerId,
    connections: HashMap<PeerId, Connection>,
}

impl ConnectionRegistry {
    /// Creates a new empty registry for the given local peer.
    pub fn new(local: PeerId) -> Self {
        ConnectionRegistry {
            local,
            connections: HashMap::new(),
        }
    }

    /// Creates a new empty registry with at least the specified capacity.
    pub fn with_capacity(local: PeerId, capacity: usize) -> Self {
        ConnectionRegistry {
            local,
            connections: HashMap::with_capacity(capacity),
        }
    }

    /// Registers an identified connection.
    pub fn add(&mut self, connection: Connection) -> Registration {
        let Some(peer_id) = connection.peer_id() else {
            warn!(%connection, "refusing to register unidentified connection");
            return Registration::Unidentified;
        };
        if peer_id == &self.local {
            error!(%connection, "refusing to register a connection to itself");
            return Registration::SelfConnection;
        }
        if self.connections.contains_key(peer_id) {
            return Registration::Duplicate;
        }

        self.connections.insert(peer_id.clone(), connection);
        Registration::Added
    }

    /// Replaces the connection registered for the connection's identity, returning the previous one.
    pub fn replace(&mut self, connection: Connection) -> Option<Connection> {
        let peer_id = connection.peer_id()?.clone();
        if peer_id == self.local {
            return None;
        }
        self.connections.insert(peer_id, connection)
    }

    /// Unregisters a connection by identity.
    ///
    /// The entry is only removed if it is this very channel, so a rejected duplicate can never unregister the live
    /// connection of the same peer. Returns whether the connection was registered.
    pub fn remove(&mut self, connection: &Connection) -> bool {
        let Some(peer_id) = connection.peer_id() else {
            return false;
        };
        match self.connections.get(peer_id) {
            Some(registered) if registered.id() == connection.id() => {
                self.connections.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    /// Gets the connection registered for a peer.
    pub fn get(&self, peer_id: &PeerId) -> Option<&Connection> {
        self.connections.get(peer_id)
    }

    /// Returns `true` if a connection to the peer is registered.
    pub fn is_connected_to(&self, peer_id: &PeerId) -> bool {
        self.connections.contains_key(peer_id)
    }

    /// A snapshot of all live connections.
    pub fn all(&self) -> Vec<Connection> {
        self.connections.values().cloned().collect()
    }

    /// An iterator visiting all live connections in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// An iterator visiting the ids of all connected peers in arbitrary order.
    pub fn peer_ids(&self) -> Keys<'_, PeerId, Connection> {
        self.connections.keys()
    }

    /// The number of registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sends a message to every registered connection.
    pub fn broadcast(&self, msg: impl Into<Message>) {
        let msg = msg.into();
        for connection in self.connections.values() {
            connection.send(msg.clone());
        }
    }

    /// Removes all connections, returning them.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }
}
