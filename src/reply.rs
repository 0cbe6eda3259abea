//! One-shot replies from the peer actor back to its callers.
//!
//! Every control operation which reports back to a caller carries a [`ReplySender`]. The sender is consumed when
//! used, so a reply is resolved exactly once, either with a value or with a [`PeerError`]. If the actor drops the
//! sender without replying (for example because it stopped), the [`ReplyReceiver`] resolves with
//! [`PeerError::ActorStopped`].

use std::fmt;

use tokio::sync::oneshot;

use crate::error::PeerError;

/// Result of a reply.
pub type ReplyResult<T> = Result<T, PeerError>;

/// Creates a new reply channel.
pub fn channel<T>() -> (ReplySender<T>, ReplyReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (ReplySender { tx }, ReplyReceiver { rx })
}

/// The sending half of a reply, resolved exactly once.
#[must_use = "the reply must be sent"]
pub struct ReplySender<T> {
    tx: oneshot::Sender<ReplyResult<T>>,
}

impl<T> ReplySender<T> {
    /// Resolves the reply with a result.
    ///
    /// If the caller is no longer waiting, the result is discarded.
    pub fn send(self, result: ReplyResult<T>) {
        let _ = self.tx.send(result);
    }

    /// Resolves the reply successfully.
    pub fn ok(self, value: T) {
        self.send(Ok(value))
    }

    /// Resolves the reply with an error.
    pub fn err(self, err: PeerError) {
        self.send(Err(err))
    }
}

impl<T> fmt::Debug for ReplySender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// The receiving half of a reply.
#[derive(Debug)]
pub struct ReplyReceiver<T> {
    rx: oneshot::Receiver<ReplyResult<T>>,
}

impl<T> ReplyReceiver<T> {
    /// Waits for the reply.
    pub async fn recv(self) -> ReplyResult<T> {
        self.rx.await.unwrap_or(Err(PeerError::ActorStopped))
    }
}
