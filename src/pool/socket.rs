//! The state machine owning one transport-level connection attempt sequence.
//!
//! A socket manager does not perform I/O itself. The pool worker spawns the
//! actual attempt tasks; the manager decides *when* an attempt runs, with
//! what timeout, and whether a failure consumes a retry or exhausts the
//! budget. Every attempt carries a generation number; completions and timers
//! tagged with an old generation are discarded, which is what makes stale
//! wakeups harmless.

use std::time::Duration;

use tokio::time::Instant;

use crate::backoff::BackoffSchedule;

/// States of a socket manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SocketState {
    /// No attempt in progress and none scheduled.
    Stopped,

    /// Waiting out a backoff delay before the next attempt.
    Delay,

    /// An attempt is in flight.
    Connecting,

    /// The last attempt succeeded and the transport is open.
    Connected,

    /// The last attempt failed; awaiting direction from the slot.
    Error,

    /// The transport closed after having connected.
    Closed,
}

/// What the owning slot should do after signalling the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SocketDirective {
    /// Spawn a connection attempt with this timeout, tagged with this
    /// generation.
    Attempt { generation: u64, timeout: Duration },

    /// Nothing to do until this instant.
    Sleep { until: Instant },

    /// The retry budget is spent.
    Exhausted,
}

#[derive(Debug)]
pub(crate) struct SocketMgr {
    state: SocketState,
    schedule: BackoffSchedule,
    generation: u64,
    /// Monitors wait out one delay before their first probe instead of
    /// connecting immediately.
    delay_first: bool,
    wake_at: Option<Instant>,
    last_timeout: Option<Duration>,
    last_delay: Option<Duration>,
    last_failure_was_timeout: bool,
}

impl SocketMgr {
    pub(crate) fn new(schedule: BackoffSchedule) -> Self {
        Self {
            state: SocketState::Stopped,
            schedule,
            generation: 0,
            delay_first: false,
            wake_at: None,
            last_timeout: None,
            last_delay: None,
            last_failure_was_timeout: false,
        }
    }

    pub(crate) fn new_monitor(schedule: BackoffSchedule) -> Self {
        let mut mgr = Self::new(schedule);
        mgr.delay_first = true;
        mgr
    }

    /// External connect signal. The first attempt runs without a delay
    /// (unless this manager was built to delay first).
    pub(crate) fn connect(&mut self, now: Instant) -> SocketDirective {
        debug_assert_eq!(self.state, SocketState::Stopped);
        if self.schedule.exhausted() {
            self.state = SocketState::Error;
            return SocketDirective::Exhausted;
        }
        if self.delay_first {
            let delay = self.schedule.next_delay();
            self.last_delay = Some(delay);
            self.state = SocketState::Delay;
            let until = now + delay;
            self.wake_at = Some(until);
            return SocketDirective::Sleep { until };
        }
        self.start_attempt()
    }

    /// Move from `delay` to `connecting` once the delay has elapsed.
    pub(crate) fn poll_wake(&mut self, now: Instant) -> Option<SocketDirective> {
        match (self.state, self.wake_at) {
            (SocketState::Delay, Some(until)) if now >= until => Some(self.start_attempt()),
            _ => None,
        }
    }

    fn start_attempt(&mut self) -> SocketDirective {
        self.generation += 1;
        self.wake_at = None;
        let timeout = self.schedule.begin_attempt();
        self.last_timeout = Some(timeout);
        self.state = SocketState::Connecting;
        SocketDirective::Attempt {
            generation: self.generation,
            timeout,
        }
    }

    /// Record a successful attempt. Returns false if the completion is stale.
    pub(crate) fn handle_success(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != SocketState::Connecting {
            return false;
        }
        self.state = SocketState::Connected;
        true
    }

    /// Record a failed attempt. The slot's policy is to retry until the
    /// budget is spent, so a retry is consumed here when one remains.
    /// Returns `None` if the completion is stale.
    pub(crate) fn handle_failure(
        &mut self,
        generation: u64,
        now: Instant,
        timed_out: bool,
    ) -> Option<SocketDirective> {
        if generation != self.generation || self.state != SocketState::Connecting {
            return None;
        }
        self.state = SocketState::Error;
        self.last_failure_was_timeout = timed_out;
        if self.schedule.exhausted() {
            return Some(SocketDirective::Exhausted);
        }
        let delay = self.schedule.next_delay();
        self.last_delay = Some(delay);
        self.state = SocketState::Delay;
        let until = now + delay;
        self.wake_at = Some(until);
        Some(SocketDirective::Sleep { until })
    }

    /// The transport closed or ended underneath an established connection.
    pub(crate) fn closed(&mut self) {
        debug_assert_eq!(self.state, SocketState::Connected);
        self.state = SocketState::Closed;
    }

    /// Tear down. Any in-flight attempt or pending timer becomes stale.
    pub(crate) fn destroy(&mut self) {
        self.generation += 1;
        self.wake_at = None;
        self.state = SocketState::Stopped;
    }

    pub(crate) fn state(&self) -> SocketState {
        self.state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn wake_at(&self) -> Option<Instant> {
        self.wake_at
    }

    /// One-based index of the most recently begun attempt.
    pub(crate) fn current_attempt(&self) -> u32 {
        self.schedule.current_attempt()
    }

    pub(crate) fn last_timeout(&self) -> Option<Duration> {
        self.last_timeout
    }

    pub(crate) fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Whether the backend looks overloaded rather than down: the most recent
    /// failure was an attempt timeout instead of an outright refusal.
    pub(crate) fn overloaded(&self) -> bool {
        self.last_failure_was_timeout
    }
}
