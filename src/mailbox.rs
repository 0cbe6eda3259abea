//! A multi-producer, single-consumer queue carrying every input of the peer actor.
//!
//! The mailbox is the only way into the peer actor. Transport tasks push [`NetworkEvent`]s, timers push [`Tick`]s and
//! the [`PeerHandle`](crate::peer::PeerHandle) pushes [`Command`]s. The actor processes them one at a time, in the
//! order they were received.
//!
//! Only handles hold strong senders. Transport tasks and timers hold a [`WeakMailboxSender`], so the actor stops
//! once the last handle is dropped.

use std::{collections::BTreeSet, fmt};

use tokio::sync::mpsc;

use crate::{
    message::Message,
    network::Dial,
    peer::{Connection, ConnectionId, PeerId},
    reply::ReplySender,
    PeerError,
};

/// Creates an unbounded mailbox for the peer actor.
pub fn unbounded() -> (MailboxSender, MailboxReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MailboxSender(tx), MailboxReceiver(rx))
}

/// Error returned by [`MailboxSender::send`] when the actor is no longer receiving.
pub struct MailboxSendError(pub Signal);

impl fmt::Debug for MailboxSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MailboxSendError").field(&self.0).finish()
    }
}

/// The sending half of the peer mailbox.
#[derive(Clone, Debug)]
pub struct MailboxSender(mpsc::UnboundedSender<Signal>);

impl MailboxSender {
    /// Sends a signal to the actor.
    pub fn send(&self, signal: Signal) -> Result<(), MailboxSendError> {
        self.0
            .send(signal)
            .map_err(|mpsc::error::SendError(signal)| MailboxSendError(signal))
    }

    /// Downgrades to a sender which does not keep the actor alive.
    pub fn downgrade(&self) -> WeakMailboxSender {
        WeakMailboxSender(self.0.downgrade())
    }
}

/// A sending half of the peer mailbox which does not keep the actor alive.
#[derive(Clone, Debug)]
pub struct WeakMailboxSender(mpsc::WeakUnboundedSender<Signal>);

impl WeakMailboxSender {
    /// Upgrades to a strong sender, if the actor is still alive.
    pub fn upgrade(&self) -> Option<MailboxSender> {
        self.0.upgrade().map(MailboxSender)
    }

    /// Sends a signal to the actor, if it is still alive.
    pub fn send(&self, signal: Signal) -> Result<(), MailboxSendError> {
        match self.upgrade() {
            Some(tx) => tx.send(signal),
            None => Err(MailboxSendError(signal)),
        }
    }
}

/// The receiving half of the peer mailbox.
#[derive(Debug)]
pub struct MailboxReceiver(mpsc::UnboundedReceiver<Signal>);

impl MailboxReceiver {
    /// Receives the next signal, or `None` once every strong sender was dropped.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.0.recv().await
    }

    /// Receives the next signal if one is immediately available.
    pub fn try_recv(&mut self) -> Option<Signal> {
        self.0.try_recv().ok()
    }
}

/// An input of the peer actor.
#[derive(Debug)]
pub enum Signal {
    /// Something happened on the network.
    Network(NetworkEvent),
    /// A control operation requested through a handle.
    Command(Command),
    /// A timer fired.
    Tick(Tick),
}

/// A connection lifecycle event or a decoded message, delivered by the transport.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A channel became active, either accepted by the listener or opened by a dial.
    ConnectionOpened {
        /// The new, unidentified connection.
        connection: Connection,
        /// The dial which opened the channel, `None` for inbound connections.
        dial: Option<Dial>,
    },
    /// A dial failed or timed out.
    ConnectFailed {
        /// The failed dial.
        dial: Dial,
        /// Why the dial failed.
        error: PeerError,
    },
    /// A message was received on a connection.
    Received {
        /// The connection the message was received on.
        id: ConnectionId,
        /// The decoded message.
        msg: Message,
    },
    /// A channel closed or errored.
    Closed {
        /// The closed connection.
        id: ConnectionId,
    },
}

/// A control operation, answered through its reply sender.
#[derive(Debug)]
pub enum Command {
    /// Open a connection to a peer listening at `host:port`.
    Connect {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u16,
        /// Resolved once the channel is active, or the attempt failed.
        reply: ReplySender<()>,
    },
    /// Close the connection to a peer.
    Disconnect {
        /// The peer to disconnect from.
        peer: PeerId,
        /// Resolved once the close was requested.
        reply: ReplySender<()>,
    },
    /// List the identities of all currently known peers.
    ListKnownPeers {
        /// Resolved with the known peers.
        reply: ReplySender<BTreeSet<PeerId>>,
    },
    /// List the identities of all connected peers.
    ConnectedPeers {
        /// Resolved with the connected peers.
        reply: ReplySender<BTreeSet<PeerId>>,
    },
    /// Start an election.
    ScheduleElection {
        /// Resolved once the election was started, or coalesced into the running one.
        reply: ReplySender<()>,
    },
    /// Query the believed leader.
    CurrentLeader {
        /// Resolved with the believed leader.
        reply: ReplySender<Option<PeerId>>,
    },
    /// Push a file to a connected neighbor.
    SendFile {
        /// The receiving neighbor.
        peer: PeerId,
        /// Name of the file.
        file_name: String,
        /// Raw file contents.
        content: Vec<u8>,
        /// Resolved once the file was queued for sending.
        reply: ReplySender<()>,
    },
    /// Leave the network.
    Leave {
        /// Resolved once the listener has been closed.
        reply: ReplySender<()>,
    },
}

impl Command {
    /// A short name of the command, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::ListKnownPeers { .. } => "list_known_peers",
            Command::ConnectedPeers { .. } => "connected_peers",
            Command::ScheduleElection { .. } => "schedule_election",
            Command::CurrentLeader { .. } => "current_leader",
            Command::SendFile { .. } => "send_file",
            Command::Leave { .. } => "leave",
        }
    }

    /// Fails the command's reply with `err`.
    pub fn reject(self, err: PeerError) {
        match self {
            Command::Connect { reply, .. }
            | Command::Disconnect { reply, .. }
            | Command::ScheduleElection { reply }
            | Command::SendFile { reply, .. }
            | Command::Leave { reply } => reply.err(err),
            Command::ListKnownPeers { reply } | Command::ConnectedPeers { reply } => reply.err(err),
            Command::CurrentLeader { reply } => reply.err(err),
        }
    }
}

/// A timer firing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Periodic keep-alive ping.
    KeepAlive,
    /// Periodic sweep of timed out pings and stale peer facts.
    Sweep,
    /// The timeout of an election round elapsed.
    ElectionTimeout {
        /// The round which timed out.
        round: u64,
    },
}
