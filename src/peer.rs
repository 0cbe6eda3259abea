//! The peer actor and everything it owns.
//!
//! A peer keeps a mesh of TCP connections to other peers, learns about peers beyond its neighbors through gossip,
//! detects failed peers by timeout, and takes part in a cluster-wide leader election.
//!
//! All mutable protocol state is owned by a single [`Peer`] actor, which runs on its own task and processes the
//! [`Signal`]s of its mailbox one at a time:
//!
//! - network events, delivered by the [transport](crate::network),
//! - control operations, sent through a [`PeerHandle`],
//! - timer ticks: a keep-alive with a randomized initial delay, a fast sweep, and per round election timeouts.
//!
//! The actor is gated behind a running flag. Once the peer left the network, every signal is rejected: replies fail
//! with [`PeerError::NotRunning`], messages and ticks are dropped. This keeps late timer firings and in-flight
//! messages from resurrecting state after [`PeerHandle::leave`].

mod connection;
mod gossip;
mod handle;
mod id;
mod leadership;
mod spawn;

use std::collections::HashMap;

use itertools::Itertools;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    error::PeerError,
    file_transfer::FileStore,
    mailbox::{Command, NetworkEvent, Signal, Tick, WeakMailboxSender},
    message::{FileMessage, Message, Pong},
    network::{Dial, Transport},
    registry::{ConnectionRegistry, Registration},
    reply::ReplySender,
};

pub use connection::{Connection, Direction, Outbound};
#[cfg(test)]
pub(crate) use connection::{drain, drain_messages};
pub use gossip::{AdvertisedAddress, Gossip};
pub use handle::PeerHandle;
pub use id::{ConnectionId, PeerId};
pub use leadership::{ElectionRound, LeaderState, Leadership, RoundStarted};

use spawn::Timers;

/// The peer actor.
pub(crate) struct Peer {
    config: Config,
    local: PeerId,
    running: bool,
    mailbox: WeakMailboxSender,
    transport: Box<dyn Transport>,
    /// Every active channel, identified or not.
    sessions: HashMap<ConnectionId, Connection>,
    registry: ConnectionRegistry,
    gossip: Gossip,
    leadership: Leadership,
    timers: Timers,
    /// Discovered peers being dialled, with the channel once it is active.
    dialing: HashMap<PeerId, Option<ConnectionId>>,
    files: FileStore,
}

impl Peer {
    pub(crate) fn new(
        config: Config,
        transport: Box<dyn Transport>,
        mailbox: WeakMailboxSender,
    ) -> Self {
        let local = config.peer_id.clone();
        Peer {
            registry: ConnectionRegistry::with_capacity(
                local.clone(),
                config.min_active_connections,
            ),
            gossip: Gossip::new(local.clone(), config.ping_timeout, config.pong_staleness),
            leadership: Leadership::new(local.clone()),
            files: FileStore::new(config.received_files_dir.clone()),
            local,
            running: true,
            mailbox,
            transport,
            sessions: HashMap::new(),
            timers: Timers::default(),
            dialing: HashMap::new(),
            config,
        }
    }

    pub(crate) fn id(&self) -> &PeerId {
        &self.local
    }

    pub(crate) fn start_timers(&mut self) {
        self.timers.start(
            &self.mailbox,
            self.config.keep_alive_period,
            self.config.sweep_interval,
        );
    }

    /// Processes a single signal.
    pub(crate) fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Network(event) => self.handle_network_event(event),
            Signal::Command(command) => self.handle_command(command),
            Signal::Tick(tick) => self.handle_tick(tick),
        }
    }

    /// Leaves the network if still running, once the mailbox closed.
    pub(crate) fn stop(&mut self) {
        if self.running {
            self.leave(None);
        }
    }

    fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::ConnectionOpened { connection, dial } => {
                self.connection_opened(connection, dial)
            }
            NetworkEvent::ConnectFailed { dial, error } => self.connect_failed(dial, error),
            NetworkEvent::Received { id, msg } => self.message_received(id, msg),
            NetworkEvent::Closed { id } => self.connection_closed(id),
        }
    }

    fn handle_command(&mut self, command: Command) {
        if !self.running {
            match command {
                Command::Leave { reply } => {
                    debug!("peer already left");
                    reply.ok(());
                }
                command => {
                    warn!(command = command.name(), "rejecting command, peer not running");
                    command.reject(PeerError::NotRunning);
                }
            }
            return;
        }

        match command {
            Command::Connect { host, port, reply } => self.dial(Dial {
                host,
                port,
                target: None,
                reply: Some(reply),
            }),
            Command::Disconnect { peer, reply } => {
                match self.registry.get(&peer) {
                    Some(connection) => {
                        info!(%peer, "disconnecting");
                        connection.close();
                    }
                    None => debug!(%peer, "cannot disconnect, peer not connected"),
                }
                reply.ok(());
            }
            Command::ListKnownPeers { reply } => self.gossip.ping(reply),
            Command::ConnectedPeers { reply } => {
                reply.ok(self.registry.peer_ids().cloned().collect())
            }
            Command::ScheduleElection { reply } => {
                let started = self.leadership.schedule_election(&self.registry);
                self.arm_election(started);
                reply.ok(());
            }
            Command::CurrentLeader { reply } => reply.ok(self.leadership.leader().cloned()),
            Command::SendFile {
                peer,
                file_name,
                content,
                reply,
            } => match self.registry.get(&peer) {
                Some(connection) => {
                    connection.send(FileMessage {
                        file_name,
                        content,
                        sender: self.local.clone(),
                    });
                    reply.ok(());
                }
                None => reply.err(PeerError::NotConnected(peer)),
            },
            Command::Leave { reply } => self.leave(Some(reply)),
        }
    }

    fn handle_tick(&mut self, tick: Tick) {
        if !self.running {
            trace!(?tick, "ignoring tick, peer not running");
            return;
        }

        match tick {
            Tick::KeepAlive => self.keep_alive(),
            Tick::Sweep => self.sweep(),
            Tick::ElectionTimeout { round } => {
                let started = self.leadership.election_timeout(round, &self.registry);
                self.arm_election(started);
            }
        }
    }

    fn connection_opened(&mut self, connection: Connection, dial: Option<Dial>) {
        if let Some(target) = dial.as_ref().and_then(|dial| dial.target.as_ref()) {
            if let Some(slot) = self.dialing.get_mut(target) {
                *slot = Some(connection.id());
            }
        }
        let reply = dial.and_then(|dial| dial.reply);

        if !self.running {
            debug!(%connection, "closing connection, peer not running");
            connection.close();
            if let Some(reply) = reply {
                reply.err(PeerError::NotRunning);
            }
            return;
        }

        connection.send(Message::Handshake {
            peer: self.local.clone(),
            leader: self.leadership.leader().cloned(),
        });
        self.sessions.insert(connection.id(), connection);
        if let Some(reply) = reply {
            reply.ok(());
        }
    }

    fn connect_failed(&mut self, dial: Dial, error: PeerError) {
        warn!(addr = %dial.addr(), target = ?dial.target, "connect failed: {error}");
        if let Some(target) = &dial.target {
            self.dialing.remove(target);
            // Dropped until a neighbor relays it again
            self.gossip.cancel_pongs(target);
        }
        if let Some(reply) = dial.reply {
            reply.err(error);
        }
    }

    fn connection_closed(&mut self, id: ConnectionId) {
        let Some(connection) = self.sessions.remove(&id) else {
            trace!(%id, "closed connection already forgotten");
            return;
        };
        self.dialing.retain(|_, channel| *channel != Some(id));
        if !self.running {
            return;
        }

        let Some(peer) = connection.peer_id().cloned() else {
            debug!(%connection, "unidentified connection closed");
            return;
        };
        if !self.registry.remove(&connection) {
            debug!(%connection, "unregistered channel closed");
            return;
        }

        info!(%peer, connections = self.registry.count(), "peer disconnected");
        self.gossip.cancel_pings(&peer);
        self.gossip.cancel_pongs(&peer);
        if self.leadership.leader() == Some(&peer) {
            info!(leader = %peer, "lost connection to leader");
            let started = self.leadership.schedule_election(&self.registry);
            self.arm_election(started);
        }
    }

    fn message_received(&mut self, id: ConnectionId, msg: Message) {
        if !self.running {
            debug!(%id, kind = msg.kind(), "dropping message, peer not running");
            return;
        }
        let Some(connection) = self.sessions.get(&id).cloned() else {
            debug!(%id, kind = msg.kind(), "dropping message of unknown connection");
            return;
        };
        trace!(%connection, ?msg, "handling message");

        let now = Instant::now();
        match msg {
            Message::Handshake { peer, leader } => self.handshake_received(id, peer, leader),
            msg if connection.peer_id().is_none() => {
                warn!(%connection, kind = msg.kind(), "message received before handshake");
            }
            Message::Ping(ping) => {
                let advertised = self.advertised_address(&connection);
                self.gossip
                    .handle_ping(&advertised, &connection, &ping, &self.registry, now);
            }
            Message::Pong(pong) => self.gossip.handle_pong(pong, now),
            Message::CancelPongs { peer } => {
                self.gossip.cancel_pongs(&peer);
            }
            Message::Leader { leader } => {
                let started = self
                    .leadership
                    .handle_leader(&connection, leader, &self.registry);
                self.arm_election(started);
            }
            Message::Election { candidate } => {
                let started = self
                    .leadership
                    .handle_election(&connection, &candidate, &self.registry);
                self.arm_election(started);
            }
            Message::Rejection => self.leadership.handle_rejection(&connection),
            Message::File(file) => self.files.store(file),
        }
    }

    fn handshake_received(&mut self, id: ConnectionId, peer: PeerId, leader: Option<PeerId>) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.set_peer_id(peer.clone()) {
            return;
        }
        let connection = session.clone();
        self.dialing
            .retain(|target, channel| target != &peer && *channel != Some(id));

        match self.registry.add(connection.clone()) {
            Registration::Added => {
                info!(%peer, %connection, connections = self.registry.count(), "peer connected");
            }
            Registration::SelfConnection => {
                connection.close();
                return;
            }
            Registration::Duplicate => {
                if !self.resolve_duplicate(&connection) {
                    return;
                }
            }
            Registration::Unidentified => return,
        }

        if let Some(leader) = leader {
            let started = self
                .leadership
                .handle_leader(&connection, leader, &self.registry);
            self.arm_election(started);
        }
        self.gossip
            .propagate_pings_to_new_connection(&connection, Instant::now());
    }

    /// Settles two channels to the same peer, returning whether the new channel was kept.
    ///
    /// Both ends keep the channel initiated by the greater peer id, so they always agree on the survivor. Two
    /// channels initiated by the same peer are told apart by the initiator's port.
    fn resolve_duplicate(&mut self, connection: &Connection) -> bool {
        let Some(existing) = connection
            .peer_id()
            .and_then(|peer| self.registry.get(peer))
            .cloned()
        else {
            return false;
        };

        let keep_new = self.channel_rank(connection) > self.channel_rank(&existing);
        let (kept, dropped) = if keep_new {
            (connection, &existing)
        } else {
            (&existing, connection)
        };
        info!(kept = %kept.id(), dropped = %dropped.id(), peer = %connection, "duplicate connection");

        if keep_new {
            let _ = self.registry.replace(connection.clone());
        }
        dropped.close();
        keep_new
    }

    fn channel_rank<'a>(&'a self, connection: &'a Connection) -> (Option<&'a PeerId>, u16) {
        let initiator_port = match connection.direction() {
            Direction::Outbound => connection.local_addr().port(),
            Direction::Inbound => connection.remote_addr().port(),
        };
        (connection.initiator(&self.local), initiator_port)
    }

    fn keep_alive(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        let discovery = self.registry.count() < self.config.min_active_connections;
        self.gossip
            .keep_alive(&self.registry, discovery, Instant::now());
    }

    /// Expires timed out pings and stale facts, then dials random candidates while below the minimum number of
    /// connections. Dials in flight count towards the minimum.
    fn sweep(&mut self) {
        let evicted = self.gossip.timeout_pings(Instant::now());
        let wanted = self
            .config
            .min_active_connections
            .saturating_sub(self.registry.count() + self.dialing.len());
        if wanted == 0 {
            return;
        }

        let candidates = self.reconnect_candidates(evicted);
        if candidates.is_empty() {
            return;
        }
        let chosen: Vec<Pong> = candidates
            .choose_multiple(&mut rand::thread_rng(), wanted)
            .cloned()
            .collect();
        debug!(
            wanted,
            candidates = candidates.len(),
            chosen = %chosen.iter().map(|pong| &pong.peer).join(", "),
            "connecting to discovered peers"
        );

        for pong in chosen {
            self.dial(Dial {
                host: pong.server_host,
                port: pong.server_port,
                target: Some(pong.peer),
                reply: None,
            });
        }
    }

    /// Evicted and cached facts about peers which are neither the local peer, connected, nor being dialled.
    fn reconnect_candidates(&self, evicted: Vec<Pong>) -> Vec<Pong> {
        evicted
            .into_iter()
            .chain(self.gossip.facts().cloned())
            .filter(|pong| {
                pong.peer != self.local
                    && !self.registry.is_connected_to(&pong.peer)
                    && !self.dialing.contains_key(&pong.peer)
            })
            .unique_by(|pong| pong.peer.clone())
            .collect()
    }

    fn dial(&mut self, dial: Dial) {
        if let Some(target) = &dial.target {
            self.dialing.insert(target.clone(), None);
        }
        self.transport.dial(dial);
    }

    /// Leaves the network.
    ///
    /// Neighbors are told to forget this peer before their connections close. The running flag flips last, and the
    /// reply resolves once the listener closed.
    fn leave(&mut self, reply: Option<ReplySender<()>>) {
        info!(
            peer = %self.local,
            connections = self.registry.count(),
            neighbors = %self.registry.peer_ids().sorted().join(", "),
            "leaving network"
        );

        self.gossip.cancel_own_ping();
        self.gossip.cancel_pongs(&self.local);
        self.registry.broadcast(Message::CancelPongs {
            peer: self.local.clone(),
        });
        self.registry.drain();
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.dialing.clear();
        self.timers.abort_all();
        let listener_closed = self.transport.close_listener();
        self.running = false;

        if let Some(reply) = reply {
            tokio::spawn(async move {
                listener_closed.await;
                reply.ok(());
            });
        }
    }

    fn arm_election(&mut self, started: Option<RoundStarted>) {
        if let Some(RoundStarted(round)) = started {
            self.timers
                .arm_election(&self.mailbox, self.config.election_timeout, round);
        }
    }

    fn advertised_address(&self, connection: &Connection) -> AdvertisedAddress {
        AdvertisedAddress {
            host: self
                .config
                .advertised_host
                .clone()
                .unwrap_or_else(|| connection.local_addr().ip().to_string()),
            port: self.transport.local_addr().port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use futures::{future::BoxFuture, FutureExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        mailbox::{self, MailboxSender},
        message::Ping,
        reply::{self, ReplyResult},
    };

    struct MockTransport {
        dials: mpsc::UnboundedSender<Dial>,
        listener_closes: Arc<AtomicUsize>,
    }

    impl Transport for MockTransport {
        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:7000".parse().unwrap()
        }

        fn dial(&mut self, dial: Dial) {
            let _ = self.dials.send(dial);
        }

        fn close_listener(&mut self) -> BoxFuture<'static, ()> {
            self.listener_closes.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(()).boxed()
        }
    }

    struct Harness {
        peer: Peer,
        dials: mpsc::UnboundedReceiver<Dial>,
        listener_closes: Arc<AtomicUsize>,
        _mailbox: MailboxSender,
    }

    impl Harness {
        fn new(name: &str, min_active_connections: usize) -> Self {
            let config = Config::new(name).min_active_connections(min_active_connections);
            let (dials_tx, dials) = mpsc::unbounded_channel();
            let listener_closes = Arc::new(AtomicUsize::new(0));
            let (mailbox, _mailbox_rx) = mailbox::unbounded();
            let transport = MockTransport {
                dials: dials_tx,
                listener_closes: listener_closes.clone(),
            };
            Harness {
                peer: Peer::new(config, Box::new(transport), mailbox.downgrade()),
                dials,
                listener_closes,
                _mailbox: mailbox,
            }
        }

        /// Opens a channel and completes the remote handshake.
        fn connect(
            &mut self,
            direction: Direction,
            remote: &str,
        ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
            self.connect_with_leader(direction, remote, None)
        }

        fn connect_with_leader(
            &mut self,
            direction: Direction,
            remote: &str,
            leader: Option<&str>,
        ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
            let (connection, rx) = Connection::mock(direction, None);
            let id = connection.id();
            self.network(NetworkEvent::ConnectionOpened {
                connection,
                dial: None,
            });
            self.receive(
                id,
                Message::Handshake {
                    peer: PeerId::from(remote),
                    leader: leader.map(PeerId::from),
                },
            );
            (id, rx)
        }

        fn network(&mut self, event: NetworkEvent) {
            self.peer.handle_signal(Signal::Network(event));
        }

        fn receive(&mut self, id: ConnectionId, msg: Message) {
            self.network(NetworkEvent::Received { id, msg });
        }

        fn tick(&mut self, tick: Tick) {
            self.peer.handle_signal(Signal::Tick(tick));
        }

        async fn command<T>(
            &mut self,
            command: impl FnOnce(ReplySender<T>) -> Command,
        ) -> ReplyResult<T> {
            let (reply, rx) = reply::channel();
            self.peer.handle_signal(Signal::Command(command(reply)));
            rx.recv().await
        }

        fn current_round(&self) -> u64 {
            match self.peer.leadership.state() {
                LeaderState::ElectionInProgress(round) => round.round,
                state => panic!("no election in progress: {state}"),
            }
        }
    }

    fn id(name: &str) -> PeerId {
        PeerId::from(name)
    }

    fn relayed_pong(peer: &str, port: u16) -> Message {
        Message::Pong(Pong {
            peer: id(peer),
            server_host: "127.0.0.1".to_string(),
            server_port: port,
            in_reply_to: None,
        })
    }

    #[tokio::test]
    async fn new_connection_receives_handshake() {
        let mut harness = Harness::new("b", 5);
        let _ = harness.peer.leadership.handle_leader(
            &Connection::mock(Direction::Inbound, Some("z")).0,
            id("z"),
            &harness.peer.registry,
        );

        let (_, mut rx) = harness.connect(Direction::Inbound, "a");

        assert_eq!(
            drain_messages(&mut rx),
            vec![Message::Handshake {
                peer: id("b"),
                leader: Some(id("z"))
            }]
        );
        assert!(harness.peer.registry.is_connected_to(&id("a")));
    }

    #[tokio::test]
    async fn self_connection_is_closed() {
        let mut harness = Harness::new("me", 5);
        let (id, mut rx) = harness.connect(Direction::Outbound, "me");

        let out = drain(&mut rx);
        assert!(matches!(out.last(), Some(Outbound::Close)));
        assert!(harness.peer.registry.is_empty());

        harness.network(NetworkEvent::Closed { id });
        assert!(harness.peer.sessions.is_empty());
    }

    #[tokio::test]
    async fn messages_before_handshake_are_dropped() {
        let mut harness = Harness::new("b", 5);
        let (connection, mut rx) = Connection::mock(Direction::Inbound, None);
        let conn_id = connection.id();
        harness.network(NetworkEvent::ConnectionOpened {
            connection,
            dial: None,
        });
        drain(&mut rx);

        harness.receive(
            conn_id,
            Message::Ping(Ping {
                origin: id("a"),
                correlation: 1,
                discovery: false,
            }),
        );

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered_with_advertised_address() {
        let mut harness = Harness::new("b", 5);
        let (conn_id, mut rx) = harness.connect(Direction::Inbound, "a");
        drain(&mut rx);

        harness.receive(
            conn_id,
            Message::Ping(Ping {
                origin: id("a"),
                correlation: 9,
                discovery: false,
            }),
        );

        assert_eq!(
            drain_messages(&mut rx),
            vec![Message::Pong(Pong {
                peer: id("b"),
                server_host: "127.0.0.1".to_string(),
                server_port: 7000,
                in_reply_to: Some(9),
            })]
        );
    }

    #[tokio::test]
    async fn duplicate_keeps_channel_initiated_by_greater_peer() {
        let mut harness = Harness::new("a", 5);
        let (ours, mut ours_rx) = harness.connect(Direction::Outbound, "b");
        let (theirs, mut theirs_rx) = harness.connect(Direction::Inbound, "b");

        // "b" initiated the inbound channel and dominates "a"
        assert_eq!(
            harness.peer.registry.get(&id("b")).map(Connection::id),
            Some(theirs)
        );
        assert!(matches!(drain(&mut ours_rx).last(), Some(Outbound::Close)));
        assert!(!matches!(
            drain(&mut theirs_rx).last(),
            Some(Outbound::Close)
        ));

        // Closing the losing channel leaves the peer connected
        harness.network(NetworkEvent::Closed { id: ours });
        assert!(harness.peer.registry.is_connected_to(&id("b")));
    }

    #[tokio::test]
    async fn duplicate_initiated_by_weaker_peer_is_closed() {
        let mut harness = Harness::new("z", 5);
        let (ours, mut ours_rx) = harness.connect(Direction::Outbound, "b");
        let (_, mut theirs_rx) = harness.connect(Direction::Inbound, "b");

        assert_eq!(
            harness.peer.registry.get(&id("b")).map(Connection::id),
            Some(ours)
        );
        assert!(!matches!(drain(&mut ours_rx).last(), Some(Outbound::Close)));
        assert!(matches!(drain(&mut theirs_rx).last(), Some(Outbound::Close)));
    }

    #[tokio::test]
    async fn closing_registered_connection_forgets_peer() {
        let mut harness = Harness::new("b", 5);
        let (a, _rx_a) = harness.connect(Direction::Inbound, "a");
        let (c, _rx_c) = harness.connect(Direction::Inbound, "c");
        harness.receive(c, relayed_pong("a", 1));
        assert!(harness.peer.gossip.is_known_peer(&id("a")));

        harness.network(NetworkEvent::Closed { id: a });

        assert!(!harness.peer.registry.is_connected_to(&id("a")));
        assert!(!harness.peer.gossip.is_known_peer(&id("a")));
    }

    #[tokio::test]
    async fn cancel_pongs_from_departing_neighbor() {
        let mut harness = Harness::new("b", 5);
        let (a, _rx_a) = harness.connect(Direction::Inbound, "a");
        harness.receive(a, relayed_pong("a", 1));
        harness.receive(a, relayed_pong("z", 26));

        harness.receive(a, Message::CancelPongs { peer: id("a") });

        let known = harness
            .command(|reply| Command::ListKnownPeers { reply })
            .await
            .unwrap();
        assert_eq!(known, BTreeSet::from([id("z")]));
    }

    #[tokio::test]
    async fn keep_alive_requests_discovery_below_minimum() {
        let mut harness = Harness::new("x", 2);
        let (_, mut rx) = harness.connect(Direction::Outbound, "y");
        drain(&mut rx);

        harness.tick(Tick::KeepAlive);
        assert!(matches!(
            &drain_messages(&mut rx)[..],
            [Message::Ping(Ping {
                discovery: true,
                ..
            })]
        ));

        let (_, _rx_z) = harness.connect(Direction::Outbound, "z");
        harness.tick(Tick::KeepAlive);
        assert!(matches!(
            &drain_messages(&mut rx)[..],
            [Message::Ping(Ping {
                discovery: false,
                ..
            })]
        ));
    }

    /// X (minimum 2) connected to Y learns about Z from Y's discovery answer and connects to it.
    #[tokio::test]
    async fn sweep_connects_to_discovered_peer() {
        let mut harness = Harness::new("x", 2);
        let (y, _rx_y) = harness.connect(Direction::Outbound, "y");
        harness.receive(y, relayed_pong("z", 26));
        harness.receive(y, relayed_pong("x", 24));

        harness.tick(Tick::Sweep);

        let dial = harness.dials.try_recv().unwrap();
        assert_eq!(dial.target, Some(id("z")));
        assert_eq!((dial.host.as_str(), dial.port), ("127.0.0.1", 26));
        assert!(harness.dials.try_recv().is_err());

        // Not dialled again while the attempt is in flight
        harness.tick(Tick::Sweep);
        assert!(harness.dials.try_recv().is_err());

        let (connection, _rx_z) = Connection::mock(Direction::Outbound, None);
        let z = connection.id();
        harness.network(NetworkEvent::ConnectionOpened {
            connection,
            dial: Some(dial),
        });
        harness.receive(
            z,
            Message::Handshake {
                peer: id("z"),
                leader: None,
            },
        );

        let connected = harness
            .command(|reply| Command::ConnectedPeers { reply })
            .await
            .unwrap();
        assert_eq!(connected, BTreeSet::from([id("y"), id("z")]));
        assert!(harness.peer.dialing.is_empty());

        harness.tick(Tick::Sweep);
        assert!(harness.dials.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_dial_forgets_unreachable_fact() {
        let mut harness = Harness::new("x", 2);
        let (y, _rx_y) = harness.connect(Direction::Outbound, "y");
        harness.receive(y, relayed_pong("z", 26));
        harness.tick(Tick::Sweep);
        let dial = harness.dials.try_recv().unwrap();

        harness.network(NetworkEvent::ConnectFailed {
            dial,
            error: PeerError::ConnectTimeout {
                addr: "127.0.0.1:26".to_string(),
            },
        });

        assert!(!harness.peer.gossip.is_known_peer(&id("z")));
        harness.tick(Tick::Sweep);
        assert!(harness.dials.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_resolves_once_channel_is_active() {
        let mut harness = Harness::new("x", 2);
        let (reply, rx) = reply::channel();
        harness.peer.handle_signal(Signal::Command(Command::Connect {
            host: "127.0.0.1".to_string(),
            port: 9000,
            reply,
        }));
        let dial = harness.dials.try_recv().unwrap();
        assert_eq!(dial.target, None);

        let (connection, mut conn_rx) = Connection::mock(Direction::Outbound, None);
        harness.network(NetworkEvent::ConnectionOpened {
            connection,
            dial: Some(dial),
        });

        rx.recv().await.unwrap();
        assert!(matches!(
            &drain_messages(&mut conn_rx)[..],
            [Message::Handshake { .. }]
        ));
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let mut harness = Harness::new("x", 2);
        let (reply, rx) = reply::channel();
        harness.peer.handle_signal(Signal::Command(Command::Connect {
            host: "127.0.0.1".to_string(),
            port: 9000,
            reply,
        }));
        let dial = harness.dials.try_recv().unwrap();

        harness.network(NetworkEvent::ConnectFailed {
            dial,
            error: PeerError::ConnectTimeout {
                addr: "127.0.0.1:9000".to_string(),
            },
        });

        assert!(matches!(
            rx.recv().await,
            Err(PeerError::ConnectTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn handshake_leader_is_reconciled() {
        let mut harness = Harness::new("b", 5);
        let (_, _rx_a) = harness.connect_with_leader(Direction::Inbound, "a", Some("a"));
        assert_eq!(harness.peer.leadership.leader(), Some(&id("a")));

        // A conflicting view starts an election
        let (_, mut rx_c) = harness.connect_with_leader(Direction::Inbound, "c", Some("c"));
        assert!(harness.peer.leadership.is_election_in_progress());
        assert!(drain_messages(&mut rx_c).contains(&Message::Election { candidate: id("b") }));
    }

    /// A (leader) disconnects from B. B starts an election, is rejected by the dominant C, does not declare itself,
    /// and accepts C once C announces itself.
    #[tokio::test]
    async fn leader_loss_defers_to_dominant_neighbor() {
        let mut harness = Harness::new("b", 5);
        let (a, _rx_a) = harness.connect_with_leader(Direction::Inbound, "a", Some("a"));
        let (c, mut rx_c) = harness.connect_with_leader(Direction::Inbound, "c", Some("a"));
        drain(&mut rx_c);
        assert_eq!(harness.peer.leadership.leader(), Some(&id("a")));

        harness.network(NetworkEvent::Closed { id: a });

        assert_eq!(
            drain_messages(&mut rx_c),
            vec![Message::Election { candidate: id("b") }]
        );
        let round = harness.current_round();

        harness.receive(c, Message::Rejection);
        harness.tick(Tick::ElectionTimeout { round });
        assert!(!drain_messages(&mut rx_c).contains(&Message::Leader { leader: id("b") }));

        harness.receive(c, Message::Leader { leader: id("c") });
        let leader = harness
            .command(|reply| Command::CurrentLeader { reply })
            .await
            .unwrap();
        assert_eq!(leader, Some(id("c")));
    }

    #[tokio::test]
    async fn send_file_requires_connection() {
        let mut harness = Harness::new("b", 5);
        let (_, mut rx_a) = harness.connect(Direction::Inbound, "a");
        drain(&mut rx_a);

        harness
            .command(|reply| Command::SendFile {
                peer: id("a"),
                file_name: "notes.txt".to_string(),
                content: b"hi".to_vec(),
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(
            &drain_messages(&mut rx_a)[..],
            [Message::File(FileMessage { file_name, sender, .. })]
                if file_name == "notes.txt" && sender == &id("b")
        ));

        let err = harness
            .command(|reply| Command::SendFile {
                peer: id("nobody"),
                file_name: "notes.txt".to_string(),
                content: Vec::new(),
                reply,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::NotConnected(peer) if peer == id("nobody")));
    }

    #[tokio::test]
    async fn leave_notifies_neighbors_once() {
        let mut harness = Harness::new("b", 5);
        let (_, mut rx_a) = harness.connect(Direction::Inbound, "a");
        let (_, mut rx_c) = harness.connect(Direction::Outbound, "c");
        drain(&mut rx_a);
        drain(&mut rx_c);

        harness
            .command(|reply| Command::Leave { reply })
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_c] {
            let out = drain(rx);
            assert_eq!(out.len(), 2);
            assert!(matches!(
                &out[0],
                Outbound::Message(Message::CancelPongs { peer }) if peer == &id("b")
            ));
            assert!(matches!(out[1], Outbound::Close));
        }
        assert!(!harness.peer.running);
        assert!(harness.peer.registry.is_empty());

        // Leaving again resolves immediately without side effects
        harness
            .command(|reply| Command::Leave { reply })
            .await
            .unwrap();
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_c).is_empty());
        assert_eq!(harness.listener_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn everything_is_rejected_after_leave() {
        let mut harness = Harness::new("b", 1);
        harness
            .command(|reply| Command::Leave { reply })
            .await
            .unwrap();

        let err = harness
            .command(|reply| Command::ListKnownPeers { reply })
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::NotRunning));
        let err = harness
            .command(|reply| Command::ScheduleElection { reply })
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::NotRunning));

        // Late connections are closed, late ticks do nothing
        let (connection, mut rx) = Connection::mock(Direction::Inbound, None);
        harness.network(NetworkEvent::ConnectionOpened {
            connection,
            dial: None,
        });
        assert!(matches!(&drain(&mut rx)[..], [Outbound::Close]));
        harness.tick(Tick::Sweep);
        harness.tick(Tick::KeepAlive);
        assert!(harness.dials.try_recv().is_err());
    }

    #[tokio::test]
    async fn received_file_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new("b", 5);
        harness.peer.files = FileStore::new(dir.path());
        let (a, _rx) = harness.connect(Direction::Inbound, "a");

        harness.receive(
            a,
            Message::File(FileMessage {
                file_name: "hello.txt".to_string(),
                content: b"hello".to_vec(),
                sender: id("a"),
            }),
        );

        let path = dir.path().join("hello.txt");
        for _ in 0..100 {
            if let Ok(content) = tokio::fs::read(&path).await {
                assert_eq!(content, b"hello");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("file was not stored");
    }
}
