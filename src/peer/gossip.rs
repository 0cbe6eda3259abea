//! Epidemic ping/pong protocol used for peer discovery and failure detection.
//!
//! The engine keeps two caches:
//!
//! - the pings this peer issued and which are still waiting for their pong, one per target peer,
//! - the peer facts ([`Pong`]s) learned from others, keyed by peer identity, each with the time it was last
//!   refreshed.
//!
//! Peer facts are never actively re-probed. A fact which is not refreshed within the staleness bound is evicted by
//! [`Gossip::timeout_pings`] and handed back to the caller as a reconnection candidate. This keeps memory bounded by
//! the staleness window, and lets the mesh heal opportunistically instead of through a separate retry loop.
//!
//! Time is always passed in by the caller, so the engine behaves deterministically under test.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    message::{Correlation, Ping, Pong},
    registry::ConnectionRegistry,
    reply::ReplySender,
};

use super::{Connection, PeerId};

/// The address a peer advertises in its pongs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertisedAddress {
    /// Host other peers should connect to.
    pub host: String,
    /// Port other peers should connect to.
    pub port: u16,
}

#[derive(Debug)]
struct IssuedPing {
    ping: Ping,
    issued_at: Instant,
}

#[derive(Debug)]
struct OutstandingPing {
    correlation: Correlation,
    issued_at: Instant,
}

#[derive(Debug)]
struct PeerFact {
    pong: Pong,
    refreshed_at: Instant,
}

/// The ping/pong gossip engine.
#[derive(Debug)]
pub struct Gossip {
    local: PeerId,
    ping_timeout: Duration,
    staleness: Duration,
    next_correlation: Correlation,
    own_ping: Option<IssuedPing>,
    outstanding: HashMap<PeerId, OutstandingPing>,
    facts: HashMap<PeerId, PeerFact>,
}

impl Gossip {
    /// Creates a new gossip engine for the local peer.
    pub fn new(local: PeerId, ping_timeout: Duration, staleness: Duration) -> Self {
        Gossip {
            local,
            ping_timeout,
            staleness,
            next_correlation: 0,
            own_ping: None,
            outstanding: HashMap::new(),
            facts: HashMap::new(),
        }
    }

    /// Answers a ping received over `connection`.
    ///
    /// The answer is a pong about the local peer carrying `advertised` as its server address. A ping from another
    /// origin refreshes that origin's fact, if one is cached. Discovery pings are additionally answered with the
    /// facts held about every connected neighbor other than the pinger.
    pub fn handle_ping(
        &mut self,
        advertised: &AdvertisedAddress,
        connection: &Connection,
        ping: &Ping,
        registry: &ConnectionRegistry,
        now: Instant,
    ) {
        connection.send(Pong {
            peer: self.local.clone(),
            server_host: advertised.host.clone(),
            server_port: advertised.port,
            in_reply_to: Some(ping.correlation),
        });

        if ping.origin != self.local {
            if let Some(fact) = self.facts.get_mut(&ping.origin) {
                fact.refreshed_at = now;
            }
        }

        if ping.discovery {
            let mut relayed = 0;
            for peer_id in registry.peer_ids() {
                if peer_id == &ping.origin || peer_id == &self.local {
                    continue;
                }
                if let Some(fact) = self.facts.get(peer_id) {
                    connection.send(fact.pong.relayed());
                    relayed += 1;
                }
            }
            trace!(origin = %ping.origin, relayed, "answered discovery ping");
        }
    }

    /// Records a pong, refreshing the fact about `pong.peer` and clearing the ping it answers.
    pub fn handle_pong(&mut self, pong: Pong, now: Instant) {
        if let Some(correlation) = pong.in_reply_to {
            let answered = self
                .outstanding
                .get(&pong.peer)
                .is_some_and(|outstanding| outstanding.correlation == correlation);
            if answered {
                self.outstanding.remove(&pong.peer);
            }
        }

        let peer_id = pong.peer.clone();
        let previous = self.facts.insert(
            peer_id.clone(),
            PeerFact {
                pong,
                refreshed_at: now,
            },
        );
        if previous.is_none() {
            debug!(%peer_id, "learned about new peer");
        }
    }

    /// Broadcasts a fresh ping to every registered connection.
    ///
    /// With `discovery` set, neighbors also answer with the facts they hold about their own neighbors.
    pub fn keep_alive(&mut self, registry: &ConnectionRegistry, discovery: bool, now: Instant) {
        let ping = Ping {
            origin: self.local.clone(),
            correlation: self.next_correlation(),
            discovery,
        };
        for connection in registry.iter() {
            if let Some(peer_id) = connection.peer_id() {
                connection.send(ping.clone());
                self.outstanding.insert(
                    peer_id.clone(),
                    OutstandingPing {
                        correlation: ping.correlation,
                        issued_at: now,
                    },
                );
            }
        }
        debug!(
            correlation = ping.correlation,
            discovery,
            targets = registry.count(),
            "sent keep-alive ping"
        );
        self.own_ping = Some(IssuedPing {
            ping,
            issued_at: now,
        });
    }

    /// Forwards the ping currently in flight to a newly identified connection, so it takes part without waiting
    /// for the next keep-alive.
    pub fn propagate_pings_to_new_connection(&mut self, connection: &Connection, now: Instant) {
        let Some(peer_id) = connection.peer_id() else {
            return;
        };
        let Some(issued) = &self.own_ping else {
            return;
        };
        if now.duration_since(issued.issued_at) >= self.ping_timeout
            || self.outstanding.contains_key(peer_id)
        {
            return;
        }

        connection.send(issued.ping.clone());
        self.outstanding.insert(
            peer_id.clone(),
            OutstandingPing {
                correlation: issued.ping.correlation,
                issued_at: now,
            },
        );
        trace!(%peer_id, correlation = issued.ping.correlation, "propagated ping to new connection");
    }

    /// Evicts every peer fact which reached the staleness bound and returns them.
    ///
    /// Outstanding pings older than the ping timeout are dropped as lost. They are not retried, the next keep-alive
    /// issues a fresh one.
    pub fn timeout_pings(&mut self, now: Instant) -> Vec<Pong> {
        let ping_timeout = self.ping_timeout;
        self.outstanding.retain(|peer_id, outstanding| {
            let alive = now.duration_since(outstanding.issued_at) < ping_timeout;
            if !alive {
                debug!(%peer_id, correlation = outstanding.correlation, "ping timed out");
            }
            alive
        });
        if self
            .own_ping
            .as_ref()
            .is_some_and(|issued| now.duration_since(issued.issued_at) >= ping_timeout)
        {
            self.own_ping = None;
        }

        let staleness = self.staleness;
        let stale: Vec<PeerId> = self
            .facts
            .iter()
            .filter(|(_, fact)| now.duration_since(fact.refreshed_at) >= staleness)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|peer_id| {
                debug!(%peer_id, "peer fact went stale");
                self.facts.remove(&peer_id).map(|fact| fact.pong)
            })
            .collect()
    }

    /// Drops the outstanding ping addressed to a peer whose connection was lost.
    pub fn cancel_pings(&mut self, peer_id: &PeerId) -> bool {
        self.outstanding.remove(peer_id).is_some()
    }

    /// Forgets everything known about a departed peer.
    pub fn cancel_pongs(&mut self, peer_id: &PeerId) -> bool {
        let removed = self.facts.remove(peer_id).is_some();
        if removed {
            debug!(%peer_id, "cancelled pongs");
        }
        removed
    }

    /// Stops advertising pings issued by this peer.
    pub fn cancel_own_ping(&mut self) {
        self.own_ping = None;
        self.outstanding.clear();
    }

    /// Resolves `reply` with the identities of all currently known peers.
    pub fn ping(&self, reply: ReplySender<BTreeSet<PeerId>>) {
        reply.ok(self.known_peers());
    }

    /// The identities of all currently known peers.
    pub fn known_peers(&self) -> BTreeSet<PeerId> {
        self.facts.keys().cloned().collect()
    }

    /// Returns `true` if a fresh fact about the peer is cached.
    pub fn is_known_peer(&self, peer_id: &PeerId) -> bool {
        self.facts.contains_key(peer_id)
    }

    /// An iterator over all cached peer facts.
    pub fn facts(&self) -> impl Iterator<Item = &Pong> {
        self.facts.values().map(|fact| &fact.pong)
    }

    /// Returns `true` if a ping to the peer is waiting for its pong.
    pub fn is_ping_outstanding(&self, peer_id: &PeerId) -> bool {
        self.outstanding.contains_key(peer_id)
    }

    fn next_correlation(&mut self) -> Correlation {
        self.next_correlation = self.next_correlation.wrapping_add(1);
        self.next_correlation
    }
}
