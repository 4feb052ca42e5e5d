//! Claim requests and the guard callers hold while using a connection.
//!
//! A `claim()` call sends a request to the pool worker carrying a one-shot
//! reply channel; the worker queues it, pairs it with an idle slot, and sends
//! back a [`Claim`] guard. Dropping the pending future cancels the claim:
//! the worker discovers the cancellation when its reply fails to deliver and
//! the offered connection goes back to the ready set.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::{
    conn::Connect,
    error::{Error, ErrorKind, Result},
    options::Backend,
    runtime::WorkerHandle,
};

use super::{worker::PoolManager, SlotId};

/// Returns a new requester/receiver pair.
pub(super) fn channel<C: Connect>(
    handle: WorkerHandle,
) -> (ClaimRequester<C>, ClaimRequestReceiver<C>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ClaimRequester {
            sender,
            _handle: handle,
        },
        ClaimRequestReceiver { receiver },
    )
}

/// Handle for requesting claims from the pool worker. Requesters keep the
/// worker alive; once every requester is dropped the worker drains and stops.
#[derive(Debug)]
pub(super) struct ClaimRequester<C: Connect> {
    sender: mpsc::UnboundedSender<ClaimRequest<C>>,
    _handle: WorkerHandle,
}

impl<C: Connect> Clone for ClaimRequester<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _handle: self._handle.clone(),
        }
    }
}

impl<C: Connect> ClaimRequester<C> {
    pub(super) async fn request(&self, timeout: Option<Duration>) -> Result<Claim<C>> {
        let (reply, receiver) = oneshot::channel();
        if self.sender.send(ClaimRequest { reply, timeout }).is_err() {
            return Err(ErrorKind::PoolStopping.into());
        }
        match receiver.await {
            Ok(outcome) => outcome,
            // The worker abandoned the handle without replying.
            Err(_) => Err(ErrorKind::ClaimCancelled.into()),
        }
    }
}

/// Receiving end of the claim requesters.
#[derive(Debug)]
pub(super) struct ClaimRequestReceiver<C: Connect> {
    receiver: mpsc::UnboundedReceiver<ClaimRequest<C>>,
}

impl<C: Connect> ClaimRequestReceiver<C> {
    pub(super) async fn recv(&mut self) -> Option<ClaimRequest<C>> {
        self.receiver.recv().await
    }
}

/// One incoming `claim()` call.
pub(super) struct ClaimRequest<C: Connect> {
    pub(super) reply: oneshot::Sender<Result<Claim<C>>>,
    pub(super) timeout: Option<Duration>,
}

/// A claim sitting in the wait queue.
pub(super) struct WaitingClaim<C: Connect> {
    pub(super) reply: oneshot::Sender<Result<Claim<C>>>,
    pub(super) enqueued_at: Instant,
    pub(super) timeout_at: Option<Instant>,
}

impl<C: Connect> WaitingClaim<C> {
    /// Deliver an outcome; a failed delivery means the claimant cancelled.
    pub(super) fn fulfill(self, outcome: Result<Claim<C>>) -> std::result::Result<(), Result<Claim<C>>> {
        self.reply.send(outcome)
    }
}

/// Identifies which slot incarnation a released connection belongs to. A
/// token whose generation no longer matches is stale: the slot has already
/// moved on and the connection is simply destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReleaseToken {
    pub(super) slot: SlotId,
    pub(super) generation: u64,
}

impl ReleaseToken {
    pub(super) fn new(slot: SlotId, generation: u64) -> Self {
        Self { slot, generation }
    }
}

/// An exclusive lease on one pooled connection.
///
/// Derefs to the connection. Dropping the claim (or calling
/// [`release`](Claim::release)) returns the connection to the pool in good
/// standing; [`release_err`](Claim::release_err) returns it flagged so its
/// slot is torn down instead of re-pooled.
pub struct Claim<C: Connect> {
    conn: Option<C::Conn>,
    backend: Backend,
    token: ReleaseToken,
    manager: PoolManager<C>,
    flagged: Option<Error>,
}

impl<C: Connect> Claim<C> {
    pub(super) fn new(
        conn: C::Conn,
        backend: Backend,
        token: ReleaseToken,
        manager: PoolManager<C>,
    ) -> Self {
        Self {
            conn: Some(conn),
            backend,
            token,
            manager,
            flagged: None,
        }
    }

    /// The backend this connection reaches.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Return the connection to the pool. Equivalent to dropping the claim.
    pub fn release(self) {}

    /// Return the connection flagged with an error the caller observed while
    /// using it. The pool destroys the connection and replaces its slot
    /// rather than handing it to another claimant.
    pub fn release_err(mut self, error: Error) {
        self.flagged = Some(error);
    }
}

impl<C: Connect> Deref for Claim<C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl<C: Connect> DerefMut for Claim<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until release")
    }
}

impl<C: Connect> Drop for Claim<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.manager
                .release(self.token, conn, self.flagged.take());
        }
    }
}

impl<C: Connect> fmt::Debug for Claim<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("backend", &self.backend)
            .field("token", &self.token)
            .field("flagged", &self.flagged)
            .finish()
    }
}
