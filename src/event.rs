//! Contains the events and functionality for monitoring the behavior of a
//! [`Pool`](crate::Pool).

use std::{sync::Arc, time::Duration};

use crate::{error::Error, options::Backend, pool::PoolState};

/// Event emitted when the pool controller changes state.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolStateChangedEvent {
    /// The logical service name, when one was configured.
    pub domain: Option<String>,

    /// The state the pool left.
    pub previous: PoolState,

    /// The state the pool entered.
    pub state: PoolState,
}

/// Event emitted when a connection to a backend finishes establishing.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectedToBackendEvent {
    /// The backend the connection reached.
    pub backend: Backend,

    /// The unique ID of the connection. This is not used for anything
    /// internally, but can be used to correlate other events for the same
    /// connection.
    pub connection_id: u64,
}

/// The reasons a connection may be closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The transport errored or closed underneath the pool.
    Error,

    /// The rebalancer retired the connection's slot.
    Unwanted,

    /// The connection sat unused past the idle ceiling while the pool was
    /// under pressure.
    Idle,

    /// The connection was recycled by decoherence.
    Recycled,

    /// The pool stopped.
    PoolStopped,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ClosedConnectionEvent {
    /// The backend the connection was for.
    pub backend: Backend,

    /// The unique ID of the connection.
    pub connection_id: u64,

    /// Why the connection was closed.
    pub reason: ConnectionClosedReason,

    /// The error that closed it, if it closed because of one.
    pub error: Option<Error>,
}

/// Event emitted when a backend exhausts its retry budget and is marked dead.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct BackendDeadEvent {
    /// The backend that died.
    pub backend: Backend,
}

/// Event emitted when a monitor reconnects to a dead backend.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct BackendRecoveredEvent {
    /// The backend that recovered.
    pub backend: Backend,
}

/// Event emitted when the overload controller sheds a queued claim.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ClaimShedEvent {
    /// How long the shed claim had been queued.
    pub sojourn: Duration,
}

/// Applications can implement this trait to specify custom logic to run on
/// each event sent by a [`Pool`](crate::Pool).
pub trait PoolEventHandler: Send + Sync {
    /// Called when the pool controller changes state.
    fn handle_state_changed_event(&self, _event: PoolStateChangedEvent) {}

    /// Called when a connection to a backend finishes establishing.
    fn handle_connected_to_backend_event(&self, _event: ConnectedToBackendEvent) {}

    /// Called when a connection is closed.
    fn handle_closed_connection_event(&self, _event: ClosedConnectionEvent) {}

    /// Called when a backend is marked dead.
    fn handle_backend_dead_event(&self, _event: BackendDeadEvent) {}

    /// Called when a dead backend recovers.
    fn handle_backend_recovered_event(&self, _event: BackendRecoveredEvent) {}

    /// Called when the overload controller sheds a claim.
    fn handle_claim_shed_event(&self, _event: ClaimShedEvent) {}
}

/// Delivers events to the user handler and mirrors them as tracing events.
#[derive(Clone)]
pub(crate) struct PoolEventEmitter {
    domain: Option<String>,
    handler: Option<Arc<dyn PoolEventHandler>>,
}

impl PoolEventEmitter {
    pub(crate) fn new(domain: Option<String>, handler: Option<Arc<dyn PoolEventHandler>>) -> Self {
        Self { domain, handler }
    }

    pub(crate) fn emit_state_changed(&self, previous: PoolState, state: PoolState) {
        tracing::debug!(domain = self.domain.as_deref(), %previous, %state, "pool state changed");
        if let Some(ref handler) = self.handler {
            handler.handle_state_changed_event(PoolStateChangedEvent {
                domain: self.domain.clone(),
                previous,
                state,
            });
        }
    }

    pub(crate) fn emit_connected(&self, backend: &Backend, connection_id: u64) {
        tracing::debug!(%backend, connection_id, "connected to backend");
        if let Some(ref handler) = self.handler {
            handler.handle_connected_to_backend_event(ConnectedToBackendEvent {
                backend: backend.clone(),
                connection_id,
            });
        }
    }

    pub(crate) fn emit_closed(
        &self,
        backend: &Backend,
        connection_id: u64,
        reason: ConnectionClosedReason,
        error: Option<Error>,
    ) {
        tracing::debug!(%backend, connection_id, ?reason, "closed connection");
        if let Some(ref handler) = self.handler {
            handler.handle_closed_connection_event(ClosedConnectionEvent {
                backend: backend.clone(),
                connection_id,
                reason,
                error,
            });
        }
    }

    pub(crate) fn emit_backend_dead(&self, backend: &Backend) {
        tracing::warn!(%backend, "backend marked dead");
        if let Some(ref handler) = self.handler {
            handler.handle_backend_dead_event(BackendDeadEvent {
                backend: backend.clone(),
            });
        }
    }

    pub(crate) fn emit_backend_recovered(&self, backend: &Backend) {
        tracing::info!(%backend, "backend recovered");
        if let Some(ref handler) = self.handler {
            handler.handle_backend_recovered_event(BackendRecoveredEvent {
                backend: backend.clone(),
            });
        }
    }

    pub(crate) fn emit_claim_shed(&self, sojourn: Duration) {
        tracing::warn!(?sojourn, "shed overloaded claim");
        if let Some(ref handler) = self.handler {
            handler.handle_claim_shed_event(ClaimShedEvent { sojourn });
        }
    }
}
