use std::{
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::message::Message;

use super::{ConnectionId, PeerId};

/// Which side opened a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The remote peer connected to our listener.
    Inbound,
    /// We connected to the remote peer.
    Outbound,
}

/// An instruction for the transport writing to a connection.
#[derive(Debug)]
pub enum Outbound {
    /// Write a message.
    Message(Message),
    /// Flush pending writes and close the connection.
    Close,
}

/// A live channel to one neighbor.
///
/// The peer identity is unknown when the channel becomes active and is set exactly once when the remote handshake
/// is received. Two connections are equal if, and only if, they carry the same peer identity.
///
/// Sending never waits for the write to happen: messages are queued to the transport, which writes them on its own
/// task.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    direction: Direction,
    peer_id: Option<PeerId>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Creates a connection which is not identified yet.
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        direction: Direction,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Connection {
            id,
            remote_addr,
            local_addr,
            direction,
            peer_id: None,
            tx,
        }
    }

    /// The transport channel id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The address of the remote end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The address of the local end of the socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Which side opened the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The negotiated peer identity, if the handshake was received.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    /// Sets the peer identity.
    ///
    /// The identity can only be set once, later attempts are logged and ignored. Returns whether the identity was
    /// set.
    pub fn set_peer_id(&mut self, peer_id: PeerId) -> bool {
        match &self.peer_id {
            None => {
                self.peer_id = Some(peer_id);
                true
            }
            Some(existing) => {
                warn!(%peer_id, %existing, connection = %self, "peer id set again for connection");
                false
            }
        }
    }

    /// The peer which initiated this channel, given the local peer id.
    pub fn initiator<'a>(&'a self, local: &'a PeerId) -> Option<&'a PeerId> {
        match self.direction {
            Direction::Outbound => Some(local),
            Direction::Inbound => self.peer_id.as_ref(),
        }
    }

    /// Queues a message for delivery.
    pub fn send(&self, msg: impl Into<Message>) {
        let msg = msg.into();
        if let Err(mpsc::error::SendError(Outbound::Message(msg))) =
            self.tx.send(Outbound::Message(msg))
        {
            error!(kind = msg.kind(), connection = %self, "cannot send message on closed connection");
        }
    }

    /// Asks the transport to close the connection.
    ///
    /// The connection closed event is delivered back to the peer once the transport has shut the channel down.
    pub fn close(&self) {
        debug!(connection = %self, "closing connection");
        let _ = self.tx.send(Outbound::Close);
    }

    /// Returns `true` while the transport is still accepting messages for this connection.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Creates an unidentified connection backed by a plain channel, for inspecting what gets sent.
    #[cfg(test)]
    pub(crate) fn mock(
        direction: Direction,
        peer_id: Option<&str>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(
            ConnectionId::generate(),
            "127.0.0.1:4000".parse().unwrap(),
            "127.0.0.1:5000".parse().unwrap(),
            direction,
            tx,
        );
        if let Some(peer_id) = peer_id {
            conn.set_peer_id(PeerId::from(peer_id));
        }
        (conn, rx)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_id {
            Some(peer_id) => write!(f, "{peer_id}@{}", self.remote_addr),
            None => write!(f, "{}@{}", self.id, self.remote_addr),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("is_open", &self.is_open())
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

/// Drains everything queued on a mock connection.
#[cfg(test)]
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Drains the messages queued on a mock connection, dropping close instructions.
#[cfg(test)]
pub(crate) fn drain_messages(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Message> {
    drain(rx)
        .into_iter()
        .filter_map(|out| match out {
            Outbound::Message(msg) => Some(msg),
            Outbound::Close => None,
        })
        .collect()
}
