use std::{
    borrow::Borrow,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The unique name a peer presents during handshake.
///
/// Peer ids are totally ordered by byte-wise lexicographic comparison of the name.
/// This ordering is the one used during leader election: when two candidates confront each other,
/// the greater id wins.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Creates a new peer id from a name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        PeerId(name.into())
    }

    /// Returns the peer name as a str.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this peer would win a direct election confrontation against `other`.
    #[inline]
    pub fn dominates(&self, other: &PeerId) -> bool {
        self > other
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({:?})", &*self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        PeerId::new(name)
    }
}

impl From<String> for PeerId {
    fn from(name: String) -> Self {
        PeerId::new(name)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A process-unique identifier for a transport channel.
///
/// Connection ids are allocated when a channel becomes active, before the remote peer has identified
/// itself, and are never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates the next connection id.
    pub fn generate() -> Self {
        ConnectionId(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}
