//! TCP transport of the peer.
//!
//! The actor never touches sockets. It asks the [`Transport`] to dial or to stop listening, and learns about
//! everything else through [`NetworkEvent`]s in its mailbox:
//!
//! - the accept loop delivers a [`NetworkEvent::ConnectionOpened`] for every inbound channel,
//! - a dial runs on its own task and delivers either [`NetworkEvent::ConnectionOpened`] or
//!   [`NetworkEvent::ConnectFailed`],
//! - each connection runs a reader task, which decodes frames into [`NetworkEvent::Received`] and reports
//!   [`NetworkEvent::Closed`] when the channel ends, and a writer task draining the connection's outbound queue.

use std::{fmt, io, net::SocketAddr, time::Duration};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    error::PeerError,
    mailbox::{NetworkEvent, Signal, WeakMailboxSender},
    peer::{Connection, ConnectionId, Direction, Outbound, PeerId},
    reply::ReplySender,
};

use super::codec::{read_frame, write_frame};

/// An outbound connection attempt.
pub struct Dial {
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// The peer expected at the address, when dialling a discovered peer.
    pub target: Option<PeerId>,
    /// The caller waiting for the attempt, when requested through a handle.
    pub reply: Option<ReplySender<()>>,
}

impl Dial {
    /// The address being dialled, as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Dial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dial")
            .field("addr", &self.addr())
            .field("target", &self.target)
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

/// The network side of a peer, as seen by the actor.
pub trait Transport: Send + 'static {
    /// The address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Starts a connection attempt.
    ///
    /// The outcome is delivered to the actor mailbox, never returned.
    fn dial(&mut self, dial: Dial);

    /// Stops accepting connections.
    ///
    /// The returned future completes once the listener is closed. Calling this more than once is a no-op.
    fn close_listener(&mut self) -> BoxFuture<'static, ()>;
}

/// Per connection settings of the TCP transport.
#[derive(Clone, Copy, Debug)]
struct ConnectionSettings {
    connect_timeout: Duration,
    idle_timeout: Duration,
    max_frame_size: usize,
}

/// A [`Transport`] over TCP.
pub struct TcpTransport {
    local_addr: SocketAddr,
    mailbox: WeakMailboxSender,
    settings: ConnectionSettings,
    listener: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(config: &Config, mailbox: WeakMailboxSender) -> Result<Self, PeerError> {
        let addr = format!("{}:{}", config.bind_host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| PeerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| PeerError::Bind { addr, source })?;
        info!(%local_addr, "listening");

        let settings = ConnectionSettings {
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            max_frame_size: config.max_frame_size,
        };
        let listener = tokio::spawn(accept_loop(listener, mailbox.clone(), settings));

        Ok(TcpTransport {
            local_addr,
            mailbox,
            settings,
            listener: Some(listener),
        })
    }
}

impl Transport for TcpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn dial(&mut self, dial: Dial) {
        let mailbox = self.mailbox.clone();
        let settings = self.settings;
        tokio::spawn(async move {
            let addr = dial.addr();
            debug!(%addr, target = ?dial.target, "dialling");
            let res = tokio::time::timeout(
                settings.connect_timeout,
                TcpStream::connect((dial.host.as_str(), dial.port)),
            )
            .await;
            let event = match res {
                Ok(Ok(stream)) => {
                    return spawn_connection(stream, Direction::Outbound, Some(dial), &mailbox, settings);
                }
                Ok(Err(source)) => NetworkEvent::ConnectFailed {
                    dial,
                    error: PeerError::Connect { addr, source },
                },
                Err(_) => NetworkEvent::ConnectFailed {
                    dial,
                    error: PeerError::ConnectTimeout { addr },
                },
            };
            let _ = mailbox.send(Signal::Network(event));
        });
    }

    fn close_listener(&mut self) -> BoxFuture<'static, ()> {
        match self.listener.take() {
            Some(listener) => {
                listener.abort();
                let local_addr = self.local_addr;
                async move {
                    let _ = listener.await;
                    info!(%local_addr, "listener closed");
                }
                .boxed()
            }
            None => futures::future::ready(()).boxed(),
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.local_addr)
            .field("listening", &self.listener.is_some())
            .finish()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, mailbox: WeakMailboxSender, settings: ConnectionSettings) {
    let mut incoming = TcpListenerStream::new(listener);
    while let Some(res) = incoming.next().await {
        match res {
            Ok(stream) => spawn_connection(stream, Direction::Inbound, None, &mailbox, settings),
            Err(err) => {
                warn!("failed to accept connection: {err}");
                continue;
            }
        }
        if mailbox.upgrade().is_none() {
            break;
        }
    }
}

/// Wraps an established stream into a [`Connection`], announces it to the actor, then starts its tasks.
fn spawn_connection(
    stream: TcpStream,
    direction: Direction,
    dial: Option<Dial>,
    mailbox: &WeakMailboxSender,
    settings: ConnectionSettings,
) {
    let addrs = stream
        .peer_addr()
        .and_then(|remote| Ok((remote, stream.local_addr()?)));
    let (remote_addr, local_addr) = match addrs {
        Ok(addrs) => addrs,
        Err(err) => {
            if let Some(dial) = dial {
                let addr = dial.addr();
                let _ = mailbox.send(Signal::Network(NetworkEvent::ConnectFailed {
                    dial,
                    error: PeerError::Connect { addr, source: err },
                }));
            } else {
                warn!("dropping accepted connection: {err}");
            }
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        trace!(%remote_addr, "failed to set nodelay: {err}");
    }

    let id = ConnectionId::generate();
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Connection::new(id, remote_addr, local_addr, direction, tx);
    debug!(%id, %remote_addr, ?direction, "connection active");

    // The actor must learn about the connection before any of its messages
    if mailbox
        .send(Signal::Network(NetworkEvent::ConnectionOpened { connection, dial }))
        .is_err()
    {
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(read_loop(id, read_half, stop_rx, mailbox.clone(), settings));
    tokio::spawn(write_loop(id, write_half, rx, stop_tx, settings));
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut stop: oneshot::Receiver<()>,
    mailbox: WeakMailboxSender,
    settings: ConnectionSettings,
) {
    loop {
        let res = tokio::select! {
            _ = &mut stop => {
                trace!(%id, "reader stopped by writer");
                break;
            }
            res = tokio::time::timeout(
                settings.idle_timeout,
                read_frame(&mut reader, settings.max_frame_size),
            ) => res,
        };

        match res {
            Ok(Ok(Some(msg))) => {
                trace!(%id, kind = msg.kind(), "received message");
                if mailbox
                    .send(Signal::Network(NetworkEvent::Received { id, msg }))
                    .is_err()
                {
                    return;
                }
            }
            Ok(Ok(None)) => {
                debug!(%id, "connection closed by remote");
                break;
            }
            Ok(Err(err)) => {
                warn!(%id, "connection read failed: {err}");
                break;
            }
            Err(_) => {
                info!(%id, idle_timeout = ?settings.idle_timeout, "connection idle, closing");
                break;
            }
        }
    }

    let _ = mailbox.send(Signal::Network(NetworkEvent::Closed { id }));
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    stop: oneshot::Sender<()>,
    settings: ConnectionSettings,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(msg) => {
                if let Err(err) = write_frame(&mut writer, &msg, settings.max_frame_size).await {
                    if err.kind() == io::ErrorKind::InvalidData {
                        error!(%id, kind = msg.kind(), "dropping unencodable message: {err}");
                        continue;
                    }
                    warn!(%id, "connection write failed: {err}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(err) = writer.shutdown().await {
        trace!(%id, "failed to shut down writer: {err}");
    }
    let _ = stop.send(());
}
