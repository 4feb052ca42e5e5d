//! The pool: a population of logical connections to a resolved set of
//! backends, handed out on demand.

#[cfg(test)]
mod test;

mod claim;
mod planner;
mod slot;
mod socket;
mod worker;

use std::{fmt, sync::Arc};

use derive_more::Display;
use tokio::sync::watch;

use crate::{
    conn::Connect,
    error::Result,
    options::{ClaimOptions, PoolOptions},
    resolver::Resolver,
};

pub use claim::Claim;

use claim::ClaimRequester;
use worker::{PoolManager, PoolWorker};

/// Identifies one slot for the life of its pool.
pub(crate) type SlotId = u64;

/// The lifecycle states of a pool.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolState {
    /// Waiting for the resolver to produce a first backend or reach steady
    /// state.
    #[display("starting")]
    Starting,

    /// Serving claims.
    #[display("running")]
    Running,

    /// Every known backend is dead; claims fail until a monitor reconnects.
    #[display("failed")]
    Failed,

    /// Draining after `stop()`.
    #[display("stopping")]
    Stopping,

    /// Fully drained. Terminal.
    #[display("stopped")]
    Stopped,
}

/// A point-in-time summary of a pool's population.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Backends currently reported by the resolver.
    pub backends: usize,

    /// Of those, how many are marked dead.
    pub dead_backends: usize,

    /// Live slots (connecting, idle, or claimed; monitors excluded).
    pub slots: usize,

    /// Connected, unclaimed slots available for pairing.
    pub ready: usize,

    /// Slots currently leased to claimants.
    pub claimed: usize,

    /// Claims waiting in the queue.
    pub queued: usize,
}

/// Snapshot published by the worker after every turn of its loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolStatus {
    pub(crate) state: PoolState,
    pub(crate) stats: PoolStats,
}

/// A pool of connections to one logical service.
///
/// `Pool` is a cheap handle; clones share the same worker. The worker stops
/// once every handle is dropped, or when [`stop`](Pool::stop) is called.
pub struct Pool<C: Connect> {
    requester: ClaimRequester<C>,
    manager: PoolManager<C>,
    status: watch::Receiver<PoolStatus>,
}

impl<C: Connect> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = *self.status.borrow();
        f.debug_struct("Pool")
            .field("state", &status.state)
            .field("stats", &status.stats)
            .finish()
    }
}

impl<C: Connect> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            requester: self.requester.clone(),
            manager: self.manager.clone(),
            status: self.status.clone(),
        }
    }
}

impl<C: Connect> Pool<C> {
    /// Validate `options`, subscribe to `resolver`, and start the pool
    /// worker. Must be called within a tokio runtime.
    pub fn start(
        options: PoolOptions,
        resolver: impl Resolver,
        connector: C,
    ) -> Result<Pool<C>> {
        options.validate()?;
        let (requester, manager, status) =
            PoolWorker::start(options, Arc::new(resolver), Arc::new(connector));
        Ok(Pool {
            requester,
            manager,
            status,
        })
    }

    /// Claim a connection, waiting in FIFO order behind earlier claims.
    ///
    /// Dropping the returned future cancels the claim. Errors are delivered
    /// through the future; `claim` itself never fails synchronously.
    pub async fn claim(&self) -> Result<Claim<C>> {
        self.requester.request(None).await
    }

    /// [`claim`](Pool::claim) with per-claim options.
    pub async fn claim_with(&self, options: ClaimOptions) -> Result<Claim<C>> {
        self.requester.request(options.timeout).await
    }

    /// The pool's current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.status.borrow().state
    }

    /// A snapshot of the pool's population.
    pub fn stats(&self) -> PoolStats {
        self.status.borrow().stats
    }

    /// Wait until the pool reaches `state`. Returns immediately if it is
    /// already there; returns on a stopped worker regardless, since no
    /// further transitions can happen.
    pub async fn wait_for_state(&self, state: PoolState) {
        let mut status = self.status.clone();
        loop {
            if status.borrow_and_update().state == state {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the pool: cancel queued claims, drain every slot, and wait for
    /// the worker to wind down. Claimed connections drain as their claimants
    /// release them. Idempotent.
    pub async fn stop(&self) {
        if let Some(ack) = self.manager.stop() {
            let _ = ack.wait_for_acknowledgment().await;
        }
    }
}
