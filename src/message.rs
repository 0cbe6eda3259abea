//! Protocol messages exchanged between peers.
//!
//! Every frame on a connection carries exactly one [`Message`]. The message space is closed: each variant is
//! handled explicitly by the peer actor, which keeps every protocol state transition in a single place.
//!
//! The first message sent on a fresh connection is always a [`Message::Handshake`], identifying the sender and
//! announcing the leader it currently believes in.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// A correlation marker tying a [`Pong`] to the [`Ping`] it answers.
pub type Correlation = u64;

/// A protocol message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// Sent immediately when a connection becomes active.
    Handshake {
        /// The sender's peer id.
        peer: PeerId,
        /// The leader the sender currently believes in, if any.
        leader: Option<PeerId>,
    },
    /// A liveness probe.
    Ping(Ping),
    /// A reachability fact about a peer.
    Pong(Pong),
    /// Departure notice: the named peer is leaving the network.
    CancelPongs {
        /// The departing peer.
        peer: PeerId,
    },
    /// Leader announcement.
    Leader {
        /// The announced leader.
        leader: PeerId,
    },
    /// Candidacy claim of the sender.
    Election {
        /// The candidate.
        candidate: PeerId,
    },
    /// Rejection of the receiver's candidacy.
    Rejection,
    /// A file pushed to a direct neighbor.
    File(FileMessage),
}

impl Message {
    /// A short name of the message kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::CancelPongs { .. } => "cancel_pongs",
            Message::Leader { .. } => "leader",
            Message::Election { .. } => "election",
            Message::Rejection => "rejection",
            Message::File(_) => "file",
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Handshake { peer, leader } => f
                .debug_struct("Handshake")
                .field("peer", peer)
                .field("leader", leader)
                .finish(),
            Message::Ping(ping) => ping.fmt(f),
            Message::Pong(pong) => pong.fmt(f),
            Message::CancelPongs { peer } => {
                f.debug_struct("CancelPongs").field("peer", peer).finish()
            }
            Message::Leader { leader } => f.debug_struct("Leader").field("leader", leader).finish(),
            Message::Election { candidate } => f
                .debug_struct("Election")
                .field("candidate", candidate)
                .finish(),
            Message::Rejection => write!(f, "Rejection"),
            Message::File(file) => file.fmt(f),
        }
    }
}

/// A liveness probe issued by `origin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// The peer which issued the ping.
    pub origin: PeerId,
    /// Correlation marker echoed back in the answering [`Pong`].
    pub correlation: Correlation,
    /// When set, the receiver also returns the facts it holds about its own neighbors.
    pub discovery: bool,
}

/// A fact about a peer's reachability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// The peer this fact is about.
    pub peer: PeerId,
    /// The host the peer accepts connections on.
    pub server_host: String,
    /// The port the peer accepts connections on.
    pub server_port: u16,
    /// The correlation of the ping this pong directly answers.
    ///
    /// `None` for facts relayed on behalf of another peer.
    pub in_reply_to: Option<Correlation>,
}

impl Pong {
    /// Returns a copy of this pong suitable for relaying to a third peer.
    pub fn relayed(&self) -> Pong {
        Pong {
            in_reply_to: None,
            ..self.clone()
        }
    }
}

/// A file transferred to a neighbor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMessage {
    /// Name of the file.
    pub file_name: String,
    /// Raw file contents.
    pub content: Vec<u8>,
    /// The sending peer.
    pub sender: PeerId,
}

impl fmt::Debug for FileMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMessage")
            .field("file_name", &self.file_name)
            .field("len", &self.content.len())
            .field("sender", &self.sender)
            .finish()
    }
}

impl From<Ping> for Message {
    fn from(ping: Ping) -> Self {
        Message::Ping(ping)
    }
}

impl From<Pong> for Message {
    fn from(pong: Pong) -> Self {
        Message::Pong(pong)
    }
}

impl From<FileMessage> for Message {
    fn from(file: FileMessage) -> Self {
        Message::File(file)
    }
}
