//! One logical connection intent toward one backend.
//!
//! A slot exclusively owns its socket manager and, while idle, its
//! connection. Claiming moves the connection into the caller's guard;
//! releasing moves it back. The slot's backend assignment never changes for
//! its whole life. Draining and teardown are synchronous from the worker's
//! point of view: tearing down the socket manager makes any in-flight
//! attempt or close watch stale, so a slot leaves the registry the moment it
//! has nothing left to wait for. The one thing a slot *does* wait for is an
//! outstanding claim, which drains on release.

use tokio::time::Instant;

use crate::options::Backend;

use super::{
    planner::{SlotPhase, SlotView},
    socket::SocketMgr,
    SlotId,
};

/// Whether a slot feeds the ready set or probes a dead backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotMode {
    Normal,
    Monitor,
}

/// Lifecycle of one slot. Slots are created connecting and removed from the
/// registry when they stop, so only live phases are represented.
#[derive(Debug)]
pub(crate) enum SlotState<T> {
    /// The socket manager is working toward an established transport.
    Starting,

    /// Connected, unclaimed, and (in normal mode) a member of the ready set.
    Idle {
        conn: T,
        connection_id: u64,
        since: Instant,
    },

    /// Connected and leased to exactly one claimant.
    Claimed { connection_id: u64 },
}

#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub(crate) id: SlotId,
    pub(crate) backend: Backend,
    pub(crate) backend_key: String,
    pub(crate) mode: SlotMode,
    pub(crate) state: SlotState<T>,
    pub(crate) unwanted: bool,
    pub(crate) socket: SocketMgr,
}

impl<T> Slot<T> {
    pub(crate) fn new(id: SlotId, backend: Backend, mode: SlotMode, socket: SocketMgr) -> Self {
        let backend_key = backend.key();
        Self {
            id,
            backend,
            backend_key,
            mode,
            state: SlotState::Starting,
            unwanted: false,
            socket,
        }
    }

    /// Record an established transport. The slot joins the idle population;
    /// monitor-mode slots never get here (their success is reported to the
    /// pool and the probe connection dropped).
    pub(crate) fn established(&mut self, conn: T, connection_id: u64, now: Instant) {
        debug_assert!(matches!(self.state, SlotState::Starting));
        debug_assert_eq!(self.mode, SlotMode::Normal);
        self.state = SlotState::Idle {
            conn,
            connection_id,
            since: now,
        };
    }

    /// Accept a claim, handing the connection to the claimant. Returns `None`
    /// when the slot can no longer honor the offer (not idle anymore, or
    /// draining), which the pool treats as a rejection of the pairing.
    pub(crate) fn try_claim(&mut self) -> Option<(T, u64)> {
        if self.unwanted {
            return None;
        }
        match std::mem::replace(&mut self.state, SlotState::Starting) {
            SlotState::Idle {
                conn,
                connection_id,
                ..
            } => {
                self.state = SlotState::Claimed { connection_id };
                Some((conn, connection_id))
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Return a released connection to the idle population. The worker has
    /// already decided the connection is still healthy and wanted.
    pub(crate) fn reidle(&mut self, conn: T, now: Instant) {
        debug_assert!(matches!(self.state, SlotState::Claimed { .. }));
        let connection_id = match self.state {
            SlotState::Claimed { connection_id } => connection_id,
            _ => 0,
        };
        self.state = SlotState::Idle {
            conn,
            connection_id,
            since: now,
        };
    }

    /// Take the idle connection for teardown.
    pub(crate) fn take_idle(&mut self) -> Option<(T, u64)> {
        match std::mem::replace(&mut self.state, SlotState::Starting) {
            SlotState::Idle {
                conn,
                connection_id,
                ..
            } => Some((conn, connection_id)),
            other => {
                self.state = other;
                None
            }
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, SlotState::Idle { .. })
    }

    pub(crate) fn is_claimed(&self) -> bool {
        matches!(self.state, SlotState::Claimed { .. })
    }

    pub(crate) fn idle_since(&self) -> Option<Instant> {
        match self.state {
            SlotState::Idle { since, .. } => Some(since),
            _ => None,
        }
    }

    pub(crate) fn phase(&self) -> SlotPhase {
        match self.state {
            SlotState::Starting => SlotPhase::Starting,
            SlotState::Idle { .. } => SlotPhase::Idle,
            SlotState::Claimed { .. } => SlotPhase::Claimed,
        }
    }

    pub(crate) fn view(&self) -> SlotView {
        SlotView {
            id: self.id,
            backend: self.backend_key.clone(),
            phase: self.phase(),
            unwanted: self.unwanted,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::backoff::{BackoffSchedule, RecoveryPolicy};

    fn slot() -> Slot<&'static str> {
        let schedule = BackoffSchedule::new(
            RecoveryPolicy::new(3, Duration::from_secs(1), Duration::from_millis(100)),
            None,
        );
        Slot::new(
            7,
            Backend::new("db.example.com", 5432),
            SlotMode::Normal,
            SocketMgr::new(schedule),
        )
    }

    #[test]
    fn claim_hands_out_the_idle_connection_once() {
        let mut slot = slot();
        slot.established("conn", 1, Instant::now());

        assert_eq!(slot.try_claim(), Some(("conn", 1)));
        assert!(slot.is_claimed());
        // A second offer against the same slot is rejected.
        assert_eq!(slot.try_claim(), None);
    }

    #[test]
    fn draining_slot_rejects_offers() {
        let mut slot = slot();
        slot.established("conn", 1, Instant::now());
        slot.unwanted = true;

        assert_eq!(slot.try_claim(), None);
        assert!(slot.is_idle());
    }

    #[test]
    fn release_returns_the_connection_to_idle() {
        let mut slot = slot();
        let t0 = Instant::now();
        slot.established("conn", 1, t0);
        slot.try_claim().unwrap();

        let t1 = t0 + Duration::from_secs(1);
        slot.reidle("conn", t1);
        assert!(slot.is_idle());
        assert_eq!(slot.idle_since(), Some(t1));
        assert_eq!(slot.try_claim(), Some(("conn", 1)));
    }

    #[test]
    fn view_reflects_phase_and_draining() {
        let mut slot = slot();
        assert_eq!(slot.view().phase, SlotPhase::Starting);

        slot.established("conn", 1, Instant::now());
        assert_eq!(slot.view().phase, SlotPhase::Idle);

        slot.try_claim().unwrap();
        slot.unwanted = true;
        let view = slot.view();
        assert_eq!(view.phase, SlotPhase::Claimed);
        assert!(view.unwanted);
        assert_eq!(view.backend, "db.example.com#5432");
    }
}
