use std::time::Duration;

use rand::Rng;
use tokio::{
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::trace;

use crate::{
    config::Config,
    mailbox::{MailboxReceiver, MailboxSender, Signal, Tick, WeakMailboxSender},
    network::Transport,
};

use super::{Peer, PeerHandle};

/// Spawns the peer actor in a Tokio task, returning a handle to it.
///
/// The actor runs until every [`PeerHandle`] was dropped. Leaving the network does not stop the actor: it keeps
/// answering, rejecting every operation with [`PeerError::NotRunning`](crate::PeerError::NotRunning).
pub(crate) fn spawn(
    config: Config,
    transport: Box<dyn Transport>,
    mailbox: MailboxSender,
    mailbox_rx: MailboxReceiver,
) -> PeerHandle {
    let handle = PeerHandle::new(config.peer_id.clone(), transport.local_addr(), mailbox.clone());
    let peer = Peer::new(config, transport, mailbox.downgrade());
    tokio::spawn(run_peer_lifecycle(peer, mailbox_rx));
    handle
}

async fn run_peer_lifecycle(mut peer: Peer, mut mailbox_rx: MailboxReceiver) {
    let id = peer.id().clone();
    trace!(peer = %id, "peer started");

    peer.start_timers();
    while let Some(signal) = mailbox_rx.recv().await {
        peer.handle_signal(signal);
    }
    peer.stop();

    trace!(peer = %id, "peer stopped");
}

/// The timers driving the autonomous behavior of a peer.
///
/// Every timer runs on its own task and only holds a weak mailbox sender. Aborted timers never fire again.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    keep_alive: Option<AbortHandle>,
    sweep: Option<AbortHandle>,
    election: Option<AbortHandle>,
}

impl Timers {
    /// Starts the keep-alive and sweep timers.
    ///
    /// The first keep-alive fires after a random delay within one period, so peers started together do not ping in
    /// lockstep.
    pub(crate) fn start(
        &mut self,
        mailbox: &WeakMailboxSender,
        keep_alive_period: Duration,
        sweep_interval: Duration,
    ) {
        let period_ms = keep_alive_period.as_millis().max(1) as u64;
        let initial_delay = Duration::from_millis(rand::thread_rng().gen_range(0..period_ms));
        let now = Instant::now();

        self.abort_all();
        self.keep_alive = Some(set_interval(
            mailbox.clone(),
            now + initial_delay,
            keep_alive_period,
            Tick::KeepAlive,
        ));
        self.sweep = Some(set_interval(
            mailbox.clone(),
            now + sweep_interval,
            sweep_interval,
            Tick::Sweep,
        ));
    }

    /// Arms the timeout of an election round, replacing the timer of any previous round.
    pub(crate) fn arm_election(&mut self, mailbox: &WeakMailboxSender, timeout: Duration, round: u64) {
        let timer = set_timeout(mailbox.clone(), timeout, Tick::ElectionTimeout { round });
        if let Some(previous) = self.election.replace(timer) {
            previous.abort();
        }
    }

    /// Aborts every timer.
    pub(crate) fn abort_all(&mut self) {
        for timer in [
            self.keep_alive.take(),
            self.sweep.take(),
            self.election.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }
}

fn set_interval(mailbox: WeakMailboxSender, start: Instant, period: Duration, tick: Tick) -> AbortHandle {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if mailbox.send(Signal::Tick(tick)).is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

fn set_timeout(mailbox: WeakMailboxSender, timeout: Duration, tick: Tick) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = mailbox.send(Signal::Tick(tick));
    })
    .abort_handle()
}
