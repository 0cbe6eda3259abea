//! Bully-style leader election.
//!
//! Any peer may challenge for leadership by broadcasting an [`Election`](Message::Election) message. A peer receiving
//! a candidacy from a weaker peer (under the [`PeerId`] ordering) rejects it and runs its own round, so the strongest
//! peer always wins a direct confrontation. A candidate which is not rejected by any neighbor before its round times
//! out declares itself leader and announces it to every connection.
//!
//! This is a best-effort, eventually convergent protocol. A partition may leave two sides with different leaders;
//! the views are reconciled when the sides reconnect, since a conflicting announcement triggers a new election.

use std::fmt;

use tracing::{debug, info, warn};

use crate::{message::Message, registry::ConnectionRegistry};

use super::{Connection, PeerId};

/// The leadership state of the local peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// No leader is known and no election is running.
    NoLeader,
    /// The given peer is believed to be the leader.
    LeaderKnown(PeerId),
    /// The local peer is running an election round.
    ElectionInProgress(ElectionRound),
}

/// An election round run by the local peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionRound {
    /// Sequence number of the round.
    pub round: u64,
    /// Whether a neighbor rejected the local candidacy during this round.
    pub rejected: bool,
}

/// A new election round started.
///
/// The caller must call [`Leadership::election_timeout`] with this round once the election timeout elapsed.
#[must_use = "the election round timer must be armed"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundStarted(pub u64);

/// The leadership state machine.
#[derive(Debug)]
pub struct Leadership {
    local: PeerId,
    state: LeaderState,
    next_round: u64,
}

impl Leadership {
    /// Creates a state machine with no known leader.
    pub fn new(local: PeerId) -> Self {
        Leadership {
            local,
            state: LeaderState::NoLeader,
            next_round: 0,
        }
    }

    /// The current state.
    pub fn state(&self) -> &LeaderState {
        &self.state
    }

    /// The leader currently believed in, if any.
    pub fn leader(&self) -> Option<&PeerId> {
        match &self.state {
            LeaderState::LeaderKnown(leader) => Some(leader),
            _ => None,
        }
    }

    /// Returns `true` while the local peer runs an election round.
    pub fn is_election_in_progress(&self) -> bool {
        matches!(self.state, LeaderState::ElectionInProgress(_))
    }

    /// Handles a leader announcement, either from a `Leader` message or from a handshake.
    pub fn handle_leader(
        &mut self,
        from: &Connection,
        announced: PeerId,
        registry: &ConnectionRegistry,
    ) -> Option<RoundStarted> {
        match &self.state {
            LeaderState::NoLeader => {
                info!(leader = %announced, from = %from, "accepted leader");
                self.state = LeaderState::LeaderKnown(announced);
                None
            }
            LeaderState::LeaderKnown(leader) if leader == &announced => None,
            LeaderState::LeaderKnown(leader) => {
                info!(
                    known = %leader,
                    %announced,
                    from = %from,
                    "known leader and announced leader differ"
                );
                self.schedule_election(registry)
            }
            LeaderState::ElectionInProgress(round)
                if !round.rejected && self.local.dominates(&announced) =>
            {
                debug!(
                    %announced,
                    round = round.round,
                    "ignoring announcement of a weaker leader during election"
                );
                None
            }
            LeaderState::ElectionInProgress(round) => {
                info!(leader = %announced, round = round.round, "election ended by leader announcement");
                self.state = LeaderState::LeaderKnown(announced);
                None
            }
        }
    }

    /// Starts an election round, unless one is already running.
    ///
    /// The believed leader is forgotten and every connection receives the local candidacy.
    pub fn schedule_election(&mut self, registry: &ConnectionRegistry) -> Option<RoundStarted> {
        if let LeaderState::ElectionInProgress(round) = &self.state {
            debug!(round = round.round, "election already in progress");
            return None;
        }

        Some(self.start_round(registry))
    }

    /// Handles a candidacy claim received over `connection`.
    ///
    /// A weaker candidate is rejected. If the believed leader also dominates the candidate, it is announced back over
    /// `connection` and no new round starts.
    pub fn handle_election(
        &mut self,
        connection: &Connection,
        candidate: &PeerId,
        registry: &ConnectionRegistry,
    ) -> Option<RoundStarted> {
        if candidate == &self.local {
            warn!(connection = %connection, "received own candidacy");
            return None;
        }
        if !self.local.dominates(candidate) {
            debug!(%candidate, "deferring to stronger candidate");
            return None;
        }

        info!(%candidate, "rejecting weaker candidate");
        connection.send(Message::Rejection);
        // A candidate behind a known stronger leader learns about it from us
        if let Some(leader) = self.leader().filter(|leader| leader.dominates(candidate)) {
            debug!(%leader, %candidate, "reasserting known leader");
            connection.send(Message::Leader {
                leader: leader.clone(),
            });
            return None;
        }

        self.schedule_election(registry)
    }

    /// Records a rejection of the local candidacy.
    pub fn handle_rejection(&mut self, connection: &Connection) {
        match &mut self.state {
            LeaderState::ElectionInProgress(round) => {
                info!(round = round.round, by = %connection, "candidacy rejected");
                round.rejected = true;
            }
            _ => debug!(by = %connection, "ignoring rejection outside of an election"),
        }
    }

    /// Completes an election round after its timeout elapsed.
    ///
    /// An unrejected candidate becomes leader and announces itself. A rejected candidate waits for the stronger peer's
    /// announcement, and starts over if none arrived. Timeouts of past rounds are ignored.
    pub fn election_timeout(
        &mut self,
        round: u64,
        registry: &ConnectionRegistry,
    ) -> Option<RoundStarted> {
        let current = match &self.state {
            LeaderState::ElectionInProgress(current) if current.round == round => *current,
            _ => {
                debug!(round, "ignoring timeout of finished election round");
                return None;
            }
        };

        if current.rejected {
            info!(round, "no leader announced after rejection, restarting election");
            return Some(self.start_round(registry));
        }

        info!(round, "no rejection received, announcing self as leader");
        self.state = LeaderState::LeaderKnown(self.local.clone());
        registry.broadcast(Message::Leader {
            leader: self.local.clone(),
        });
        None
    }

    fn start_round(&mut self, registry: &ConnectionRegistry) -> RoundStarted {
        self.next_round += 1;
        let round = self.next_round;
        self.state = LeaderState::ElectionInProgress(ElectionRound {
            round,
            rejected: false,
        });
        info!(round, neighbors = registry.count(), "starting election");
        registry.broadcast(Message::Election {
            candidate: self.local.clone(),
        });
        RoundStarted(round)
    }
}

impl fmt::Display for LeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderState::NoLeader => write!(f, "no leader"),
            LeaderState::LeaderKnown(leader) => write!(f, "leader {leader}"),
            LeaderState::ElectionInProgress(round) => write!(f, "election round {}", round.round),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::peer::{drain_messages, Direction, Outbound};

    struct Node {
        leadership: Leadership,
        registry: ConnectionRegistry,
    }

    impl Node {
        fn new(local: &str) -> Self {
            Node {
                leadership: Leadership::new(PeerId::from(local)),
                registry: ConnectionRegistry::new(PeerId::from(local)),
            }
        }

        fn connect(&mut self, peer: &str) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
            let (conn, rx) = Connection::mock(Direction::Outbound, Some(peer));
            let _ = self.registry.add(conn.clone());
            (conn, rx)
        }
    }

    fn id(name: &str) -> PeerId {
        PeerId::from(name)
    }

    #[test]
    fn accept_leader_when_none_known() {
        let mut node = Node::new("b");
        let (a, _rx) = node.connect("a");

        assert_eq!(node.leadership.handle_leader(&a, id("a"), &node.registry), None);
        assert_eq!(node.leadership.leader(), Some(&id("a")));
    }

    #[test]
    fn same_announcement_is_a_no_op() {
        let mut node = Node::new("b");
        let (a, mut rx) = node.connect("a");
        let _ = node.leadership.handle_leader(&a, id("a"), &node.registry);

        assert_eq!(node.leadership.handle_leader(&a, id("a"), &node.registry), None);
        assert_eq!(node.leadership.leader(), Some(&id("a")));
        assert!(drain_messages(&mut rx).is_empty());
    }

    #[test]
    fn conflicting_announcement_triggers_election() {
        let mut node = Node::new("b");
        let (a, mut rx) = node.connect("a");
        let _ = node.leadership.handle_leader(&a, id("a"), &node.registry);

        let started = node.leadership.handle_leader(&a, id("c"), &node.registry);
        assert_eq!(started, Some(RoundStarted(1)));
        assert!(node.leadership.is_election_in_progress());
        assert_eq!(node.leadership.leader(), None);
        assert_eq!(
            drain_messages(&mut rx),
            vec![Message::Election { candidate: id("b") }]
        );
    }

    #[test]
    fn elections_are_coalesced() {
        let mut node = Node::new("b");
        let (_a, mut rx) = node.connect("a");

        assert_eq!(node.leadership.schedule_election(&node.registry), Some(RoundStarted(1)));
        assert_eq!(node.leadership.schedule_election(&node.registry), None);
        assert_eq!(drain_messages(&mut rx).len(), 1);
    }

    #[test]
    fn unrejected_candidate_becomes_leader() {
        let mut node = Node::new("b");
        let (_a, mut rx) = node.connect("a");

        let RoundStarted(round) = node.leadership.schedule_election(&node.registry).unwrap();
        assert_eq!(node.leadership.election_timeout(round, &node.registry), None);

        assert_eq!(node.leadership.leader(), Some(&id("b")));
        assert_eq!(
            drain_messages(&mut rx),
            vec![
                Message::Election { candidate: id("b") },
                Message::Leader { leader: id("b") }
            ]
        );
    }

    #[test]
    fn lonely_candidate_becomes_leader() {
        let mut node = Node::new("solo");
        let RoundStarted(round) = node.leadership.schedule_election(&node.registry).unwrap();
        let _ = node.leadership.election_timeout(round, &node.registry);
        assert_eq!(node.leadership.leader(), Some(&id("solo")));
    }

    #[test]
    fn rejected_candidate_does_not_declare() {
        let mut node = Node::new("b");
        let (c, mut rx) = node.connect("c");

        let RoundStarted(round) = node.leadership.schedule_election(&node.registry).unwrap();
        node.leadership.handle_rejection(&c);

        // No announcement arrived, so a fresh round starts instead of self declaring
        let restarted = node.leadership.election_timeout(round, &node.registry);
        assert_eq!(restarted, Some(RoundStarted(round + 1)));
        assert_eq!(node.leadership.leader(), None);
        assert!(drain_messages(&mut rx)
            .iter()
            .all(|msg| !matches!(msg, Message::Leader { .. })));
    }

    #[test]
    fn stale_round_timeout_is_ignored() {
        let mut node = Node::new("b");
        let (c, _rx) = node.connect("c");

        let RoundStarted(round) = node.leadership.schedule_election(&node.registry).unwrap();
        let _ = node.leadership.handle_leader(&c, id("c"), &node.registry);

        assert_eq!(node.leadership.election_timeout(round, &node.registry), None);
        assert_eq!(node.leadership.leader(), Some(&id("c")));
    }

    #[test]
    fn stronger_peer_rejects_and_runs_own_election() {
        let mut node = Node::new("c");
        let (b, mut rx) = node.connect("b");

        let started = node.leadership.handle_election(&b, &id("b"), &node.registry);
        assert_eq!(started, Some(RoundStarted(1)));
        assert_eq!(
            drain_messages(&mut rx),
            vec![
                Message::Rejection,
                Message::Election { candidate: id("c") }
            ]
        );
    }

    #[test]
    fn weaker_peer_defers() {
        let mut node = Node::new("b");
        let (c, mut rx) = node.connect("c");

        assert_eq!(node.leadership.handle_election(&c, &id("c"), &node.registry), None);
        assert!(drain_messages(&mut rx).is_empty());
        assert_eq!(node.leadership.state(), &LeaderState::NoLeader);
    }

    #[test]
    fn leader_reasserts_itself_against_weaker_candidate() {
        let mut node = Node::new("c");
        let (b, mut rx) = node.connect("b");
        let RoundStarted(round) = node.leadership.schedule_election(&node.registry).unwrap();
        let _ = node.leadership.election_timeout(round, &node.registry);
        drain_messages(&mut rx);

        assert_eq!(node.leadership.handle_election(&b, &id("b"), &node.registry), None);
        assert_eq!(
            drain_messages(&mut rx),
            vec![Message::Rejection, Message::Leader { leader: id("c") }]
        );
        assert_eq!(node.leadership.leader(), Some(&id("c")));
    }

    #[test]
    fn known_stronger_leader_is_relayed_to_weaker_candidate() {
        let mut node = Node::new("c");
        let (b, mut rx) = node.connect("b");
        let (z, _z_rx) = node.connect("z");
        let _ = node.leadership.handle_leader(&z, id("z"), &node.registry);

        assert_eq!(node.leadership.handle_election(&b, &id("b"), &node.registry), None);
        assert_eq!(
            drain_messages(&mut rx),
            vec![Message::Rejection, Message::Leader { leader: id("z") }]
        );
        assert_eq!(node.leadership.leader(), Some(&id("z")));
    }

    #[test]
    fn weaker_known_leader_does_not_settle_candidacy() {
        let mut node = Node::new("c");
        let (b, mut rx) = node.connect("b");
        let (a, _a_rx) = node.connect("a");
        let _ = node.leadership.handle_leader(&a, id("a"), &node.registry);

        let started = node.leadership.handle_election(&b, &id("b"), &node.registry);
        assert_eq!(started, Some(RoundStarted(1)));
        assert_eq!(
            drain_messages(&mut rx),
            vec![
                Message::Rejection,
                Message::Election { candidate: id("c") }
            ]
        );
    }

    #[test]
    fn weaker_announcement_ignored_by_unrejected_candidate() {
        let mut node = Node::new("c");
        let (b, _rx) = node.connect("b");
        let RoundStarted(round) = node.leadership.schedule_election(&node.registry).unwrap();

        let _ = node.leadership.handle_leader(&b, id("b"), &node.registry);
        assert!(node.leadership.is_election_in_progress());

        let _ = node.leadership.election_timeout(round, &node.registry);
        assert_eq!(node.leadership.leader(), Some(&id("c")));
    }

    /// Two candidates connected to each other: only the dominant one ever declares itself.
    #[test]
    fn dominant_candidate_wins_confrontation() {
        let mut a = Node::new("a");
        let mut z = Node::new("z");
        let (a_to_z, mut a_out) = a.connect("z");
        let (z_to_a, mut z_out) = z.connect("a");

        let RoundStarted(a_round) = a.leadership.schedule_election(&a.registry).unwrap();
        let RoundStarted(z_round) = z.leadership.schedule_election(&z.registry).unwrap();

        // Deliver every message until both sides are quiet
        loop {
            let from_a = drain_messages(&mut a_out);
            let from_z = drain_messages(&mut z_out);
            if from_a.is_empty() && from_z.is_empty() {
                break;
            }
            for msg in from_a {
                deliver(&mut z, &z_to_a, msg);
            }
            for msg in from_z {
                deliver(&mut a, &a_to_z, msg);
            }
        }

        assert!(matches!(
            a.leadership.state(),
            LeaderState::ElectionInProgress(ElectionRound { rejected: true, .. })
        ));

        let _ = z.leadership.election_timeout(z_round, &z.registry);
        for msg in drain_messages(&mut z_out) {
            deliver(&mut a, &a_to_z, msg);
        }
        let _ = a.leadership.election_timeout(a_round, &a.registry);

        assert_eq!(z.leadership.leader(), Some(&id("z")));
        assert_eq!(a.leadership.leader(), Some(&id("z")));
    }

    /// Line topology b - c - z, where z already leads: b's candidacy settles on z without c losing track of it.
    #[test]
    fn candidacy_behind_known_leader_settles_in_a_line() {
        let mut b = Node::new("b");
        let mut c = Node::new("c");
        let mut z = Node::new("z");
        let (b_to_c, mut b_out) = b.connect("c");
        let (c_to_b, mut c_to_b_out) = c.connect("b");
        let (c_to_z, mut c_to_z_out) = c.connect("z");
        let (z_to_c, mut z_out) = z.connect("c");

        let RoundStarted(round) = z.leadership.schedule_election(&z.registry).unwrap();
        let _ = z.leadership.election_timeout(round, &z.registry);
        for msg in drain_messages(&mut z_out) {
            deliver(&mut c, &c_to_z, msg);
        }
        assert_eq!(c.leadership.leader(), Some(&id("z")));

        let RoundStarted(b_round) = b.leadership.schedule_election(&b.registry).unwrap();
        loop {
            let from_b = drain_messages(&mut b_out);
            let from_c_to_b = drain_messages(&mut c_to_b_out);
            let from_c_to_z = drain_messages(&mut c_to_z_out);
            let from_z = drain_messages(&mut z_out);
            if from_b.is_empty()
                && from_c_to_b.is_empty()
                && from_c_to_z.is_empty()
                && from_z.is_empty()
            {
                break;
            }
            for msg in from_b {
                deliver(&mut c, &c_to_b, msg);
            }
            for msg in from_c_to_b {
                deliver(&mut b, &b_to_c, msg);
            }
            for msg in from_c_to_z {
                deliver(&mut z, &z_to_c, msg);
            }
            for msg in from_z {
                deliver(&mut c, &c_to_z, msg);
            }
        }

        // The round already ended with z's announcement
        assert_eq!(b.leadership.election_timeout(b_round, &b.registry), None);
        assert_eq!(b.leadership.leader(), Some(&id("z")));
        assert_eq!(c.leadership.leader(), Some(&id("z")));
        assert_eq!(z.leadership.leader(), Some(&id("z")));
    }

    fn deliver(node: &mut Node, from: &Connection, msg: Message) {
        match msg {
            Message::Election { candidate } => {
                let _ = node.leadership.handle_election(from, &candidate, &node.registry);
            }
            Message::Rejection => node.leadership.handle_rejection(from),
            Message::Leader { leader } => {
                let _ = node.leadership.handle_leader(from, leader, &node.registry);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
