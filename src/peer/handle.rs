use std::{collections::BTreeSet, io, net::SocketAddr, path::Path};

use tracing::debug;

use crate::{
    config::Config,
    error::PeerError,
    mailbox::{self, Command, MailboxSender, Signal},
    network::TcpTransport,
    reply::{self, ReplySender},
};

use super::{spawn, PeerId};

/// A handle to a running peer.
///
/// Handles are cheap to clone. Every operation is sent to the peer actor and answered exactly once, either with a
/// value or with a [`PeerError`]. Once the peer left the network every operation fails with
/// [`PeerError::NotRunning`], except [`leave`](PeerHandle::leave) which succeeds immediately.
///
/// The peer actor stops when the last handle is dropped.
///
/// # Example
///
/// ```
/// use p2p_peer::{Config, PeerHandle};
///
/// # tokio_test::block_on(async {
/// let alice = PeerHandle::start(Config::new("alice").bind_host("127.0.0.1")).await?;
/// let bob = PeerHandle::start(Config::new("bob").bind_host("127.0.0.1")).await?;
///
/// bob.connect("127.0.0.1", alice.local_addr().port()).await?;
///
/// bob.leave().await?;
/// alice.leave().await?;
/// # Ok::<(), p2p_peer::PeerError>(())
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct PeerHandle {
    peer_id: PeerId,
    local_addr: SocketAddr,
    mailbox: MailboxSender,
}

impl PeerHandle {
    /// Binds the listener and starts a peer.
    ///
    /// Fails with [`PeerError::InvalidConfig`] if the config does not validate, and with [`PeerError::Bind`] if the
    /// listener cannot be bound.
    pub async fn start(config: Config) -> Result<Self, PeerError> {
        config.validate()?;
        let (mailbox, mailbox_rx) = mailbox::unbounded();
        let transport = TcpTransport::bind(&config, mailbox.downgrade()).await?;
        Ok(spawn::spawn(config, Box::new(transport), mailbox, mailbox_rx))
    }

    pub(crate) fn new(peer_id: PeerId, local_addr: SocketAddr, mailbox: MailboxSender) -> Self {
        PeerHandle {
            peer_id,
            local_addr,
            mailbox,
        }
    }

    /// The local peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connects to a peer listening at `host:port`.
    ///
    /// Resolves once the channel is active. The remote identity is learned asynchronously through the handshake.
    pub async fn connect(&self, host: impl Into<String>, port: u16) -> Result<(), PeerError> {
        let host = host.into();
        self.request(|reply| Command::Connect { host, port, reply })
            .await
    }

    /// Closes the connection to a peer. Disconnecting from a peer which is not connected is a no-op.
    pub async fn disconnect(&self, peer: impl Into<PeerId>) -> Result<(), PeerError> {
        let peer = peer.into();
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    /// The identities of all peers currently known through gossip.
    pub async fn list_known_peers(&self) -> Result<BTreeSet<PeerId>, PeerError> {
        self.request(|reply| Command::ListKnownPeers { reply }).await
    }

    /// The identities of all directly connected peers.
    pub async fn connected_peers(&self) -> Result<BTreeSet<PeerId>, PeerError> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }

    /// Starts an election, unless one is already in progress.
    pub async fn schedule_election(&self) -> Result<(), PeerError> {
        self.request(|reply| Command::ScheduleElection { reply })
            .await
    }

    /// The leader this peer currently believes in.
    ///
    /// `None` while no leader is known, including while an election is in progress.
    pub async fn current_leader(&self) -> Result<Option<PeerId>, PeerError> {
        self.request(|reply| Command::CurrentLeader { reply }).await
    }

    /// Sends a file to a directly connected peer.
    ///
    /// The receiver stores it under its received files directory, using the final component of `path` as name.
    pub async fn send_file(
        &self,
        peer: impl Into<PeerId>,
        path: impl AsRef<Path>,
    ) -> Result<(), PeerError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} does not name a file", path.display()),
                )
            })?
            .to_string();
        let content = tokio::fs::read(path).await?;
        debug!(%file_name, len = content.len(), "sending file");

        let peer = peer.into();
        self.request(|reply| Command::SendFile {
            peer,
            file_name,
            content,
            reply,
        })
        .await
    }

    /// Leaves the network.
    ///
    /// Neighbors are told to forget this peer, every connection is closed and the listener is shut down. Resolves
    /// once the listener is closed. Leaving twice is harmless.
    pub async fn leave(&self) -> Result<(), PeerError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(ReplySender<T>) -> Command,
    ) -> Result<T, PeerError> {
        let (reply, rx) = reply::channel();
        self.mailbox
            .send(Signal::Command(command(reply)))
            .map_err(|_| PeerError::ActorStopped)?;
        rx.recv().await
    }
}
