//! The connection capability the pool consumes.
//!
//! The pool never interprets a connection's payload; it only needs to open
//! one, learn when it dies, and drop it to destroy it. Implementors adapt a
//! concrete transport to that surface.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::{
    error::{Error, Result},
    options::Backend,
};

/// A successfully established connection, paired with the future that
/// observes its death.
pub struct Established<C> {
    /// The connection object handed to claimants.
    pub conn: C,

    /// Resolves exactly once, when the transport closes, ends, or errors.
    /// The pool holds this for the connection's whole life, so it must not
    /// borrow from `conn`.
    pub closed: BoxFuture<'static, Error>,
}

impl<C> Established<C> {
    /// Pair a connection with its close watch.
    pub fn new(conn: C, closed: impl Future<Output = Error> + Send + 'static) -> Self {
        Self {
            conn,
            closed: Box::pin(closed),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for Established<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established").field("conn", &self.conn).finish()
    }
}

/// A trait which provides the transport-specific logic for opening
/// connections to backends.
///
/// Contract:
///
/// - `connect` resolves once the transport is fully usable; establishment
///   failures are returned as errors, not reported through `closed`.
/// - The returned `closed` future resolves exactly once, after establishment,
///   whether the transport errors, is closed by the peer, or ends.
/// - Dropping the connection object must tear the transport down. The pool
///   drops each connection exactly once.
/// - The pool applies its own per-attempt timeout around `connect`; an
///   implementation does not need to time out on its own.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// The connection type this connector produces.
    type Conn: Send + 'static;

    /// Attempt to open a transport to `backend`.
    async fn connect(&self, backend: &Backend) -> Result<Established<Self::Conn>>;
}
