//! The worker task that owns all of a pool's state.
//!
//! Every table the pool keeps (backends, slots, monitors, the ready set, the
//! claim queue) lives inside this one task, and every mutation happens
//! between awaits of its select loop, so no interleaving is possible without
//! an explicit yield. The `biased` ordering of the loop is load-bearing:
//! management traffic (releases, socket completions, membership changes)
//! always drains before new claim requests are admitted, which is what lets
//! the pairing logic trust that a slot offered to a claimant was idle as of
//! every event received so far.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use futures_util::future::BoxFuture;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::{
    backoff::BackoffSchedule,
    codel::OverloadController,
    conn::{Connect, Established},
    error::{Error, ErrorKind, Result},
    event::{ConnectionClosedReason, PoolEventEmitter},
    options::PoolOptions,
    resolver::{self, Resolver, ResolverChange},
    runtime::{self, AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender, WorkerHandleListener},
};

use super::{
    claim::{self, Claim, ClaimRequest, ClaimRequestReceiver, ClaimRequester, ReleaseToken, WaitingClaim},
    planner::{plan, LowPass, PlanAction, PlanInput},
    slot::{Slot, SlotMode, SlotState},
    socket::{SocketDirective, SocketMgr},
    PoolState, PoolStats, PoolStatus, SlotId,
};

const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// One backend known to the pool. Entries outlive their retraction by the
/// resolver as long as any slot still references them.
#[derive(Debug)]
struct BackendEntry {
    backend: crate::options::Backend,
    /// Insertion order; the planner gives distribution remainders to the
    /// earliest entries.
    seq: u64,
    /// Still reported by the resolver.
    resolved: bool,
    dead: bool,
    last_dead: Option<Instant>,
}

/// Requests sent to the worker by claim guards, spawned attempt tasks, close
/// watches, and `Pool::stop`.
pub(super) enum PoolMessage<C: Connect> {
    AttemptResolved {
        slot: SlotId,
        generation: u64,
        result: Result<Established<C::Conn>>,
    },
    ConnectionClosed {
        slot: SlotId,
        generation: u64,
        error: Error,
    },
    Release {
        token: ReleaseToken,
        conn: C::Conn,
        flagged: Option<Error>,
    },
    Stop(AcknowledgedMessage<()>),
}

/// Cloneable sender attached to claims and background tasks. Unlike a
/// `ClaimRequester`, holding one does not keep the worker alive.
pub(super) struct PoolManager<C: Connect> {
    sender: mpsc::UnboundedSender<PoolMessage<C>>,
}

impl<C: Connect> Clone for PoolManager<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<C: Connect> PoolManager<C> {
    fn attempt_resolved(&self, slot: SlotId, generation: u64, result: Result<Established<C::Conn>>) {
        let _ = self.sender.send(PoolMessage::AttemptResolved {
            slot,
            generation,
            result,
        });
    }

    fn connection_closed(&self, slot: SlotId, generation: u64, error: Error) {
        let _ = self.sender.send(PoolMessage::ConnectionClosed {
            slot,
            generation,
            error,
        });
    }

    /// Return a claimed connection. The worker going away just means the
    /// connection is dropped here instead.
    pub(super) fn release(&self, token: ReleaseToken, conn: C::Conn, flagged: Option<Error>) {
        let _ = self.sender.send(PoolMessage::Release {
            token,
            conn,
            flagged,
        });
    }

    pub(super) fn stop(&self) -> Option<AcknowledgmentReceiver<()>> {
        let (message, receiver) = AcknowledgedMessage::package(());
        match self.sender.send(PoolMessage::Stop(message)) {
            Ok(()) => Some(receiver),
            Err(_) => None,
        }
    }
}

/// A worker task that manages the shared state of one pool.
pub(super) struct PoolWorker<C: Connect> {
    options: PoolOptions,
    connector: Arc<C>,
    resolver: Arc<dyn Resolver>,
    emitter: PoolEventEmitter,

    /// Current state of the pool controller.
    state: PoolState,
    resolver_steady: bool,

    backends: HashMap<String, BackendEntry>,
    next_backend_seq: u64,

    /// Every live slot, both modes.
    slots: HashMap<SlotId, Slot<C::Conn>>,
    /// Dead backend key to the single monitor slot probing it.
    monitors: HashMap<String, SlotId>,
    /// Idle slots in offer order. Entries are validated at pop; a slot that
    /// died or drained since it was pushed is simply skipped.
    ready: VecDeque<SlotId>,
    next_slot_id: SlotId,
    next_connection_id: u64,

    /// Waiting claims in FIFO enqueue order.
    queue: VecDeque<WaitingClaim<C>>,
    codel: OverloadController,
    lowpass: LowPass,
    /// Whether the previous turn of the loop left a usable idle connection,
    /// for edge-detecting the transition the overload controller cares about.
    ready_was_available: bool,

    decoherence_at: Option<Instant>,
    maintenance_at: Instant,
    rng: SmallRng,

    needs_replan: bool,
    stop_acks: Vec<AcknowledgmentSender<()>>,

    manager: PoolManager<C>,
    management_rx: mpsc::UnboundedReceiver<PoolMessage<C>>,
    resolver_rx: mpsc::UnboundedReceiver<ResolverChange>,
    request_rx: ClaimRequestReceiver<C>,
    handle_listener: WorkerHandleListener,
    status_tx: watch::Sender<PoolStatus>,
}

impl<C: Connect> PoolWorker<C> {
    /// Start a worker and return the handles the public pool surface needs.
    /// Once every claim requester is dropped the worker drains and stops on
    /// its own.
    pub(super) fn start(
        options: PoolOptions,
        resolver: Arc<dyn Resolver>,
        connector: Arc<C>,
    ) -> (
        ClaimRequester<C>,
        PoolManager<C>,
        watch::Receiver<PoolStatus>,
    ) {
        let now = Instant::now();

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (requester, request_rx) = claim::channel(handle);
        let (management_tx, management_rx) = mpsc::unbounded_channel();
        let manager = PoolManager {
            sender: management_tx,
        };
        let (sink, resolver_rx) = resolver::channel();

        let emitter = PoolEventEmitter::new(options.domain.clone(), options.event_handler.clone());
        let codel = OverloadController::new(&options.overload, now);
        let lowpass = LowPass::new(options.lowpass_decay_or_default(), now);
        let decoherence_at = options
            .decoherence_interval
            .map(|interval| now + interval / options.configured_target().max(1));

        let (status_tx, status_rx) = watch::channel(PoolStatus {
            state: PoolState::Starting,
            stats: PoolStats::default(),
        });

        let worker = PoolWorker {
            options,
            connector,
            resolver: resolver.clone(),
            emitter,
            state: PoolState::Starting,
            resolver_steady: false,
            backends: HashMap::new(),
            next_backend_seq: 0,
            slots: HashMap::new(),
            monitors: HashMap::new(),
            ready: VecDeque::new(),
            next_slot_id: 1,
            next_connection_id: 1,
            queue: VecDeque::new(),
            codel,
            lowpass,
            ready_was_available: false,
            decoherence_at,
            maintenance_at: now + MAINTENANCE_FREQUENCY,
            rng: SmallRng::from_os_rng(),
            needs_replan: false,
            stop_acks: Vec::new(),
            manager: manager.clone(),
            management_rx,
            resolver_rx,
            request_rx,
            handle_listener,
            status_tx,
        };

        resolver.start(sink);
        runtime::spawn(worker.execute());

        (requester, manager, status_rx)
    }

    /// Run the worker until the pool has fully stopped. The `biased` ordering
    /// gives management traffic and membership changes priority over new
    /// claim requests, with timers last.
    async fn execute(mut self) {
        loop {
            let wake = self.next_wake();
            tokio::select! {
                biased;

                Some(message) = self.management_rx.recv() => {
                    self.handle_management(message);
                }
                Some(change) = self.resolver_rx.recv(), if !self.is_stopping() => {
                    self.handle_resolver(change);
                }
                _ = self.handle_listener.wait_for_all_handle_drops(), if !self.is_stopping() => {
                    // no references to the pool remain; drain and shut down
                    self.begin_stop(None);
                }
                Some(request) = self.request_rx.recv() => {
                    self.handle_claim_request(request);
                }
                _ = tokio::time::sleep_until(wake) => {
                    self.fire_timers();
                }
            }

            self.drive();

            if matches!(self.state, PoolState::Stopping) && self.slots.is_empty() {
                break;
            }
        }

        self.finalize();
    }

    fn finalize(&mut self) {
        self.set_state(PoolState::Stopped);
        self.publish_status();
        for ack in self.stop_acks.drain(..) {
            ack.acknowledge(());
        }
    }

    fn is_stopping(&self) -> bool {
        matches!(self.state, PoolState::Stopping | PoolState::Stopped)
    }

    fn set_state(&mut self, state: PoolState) {
        if self.state == state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        self.emitter.emit_state_changed(previous, state);
    }

    /// Work performed after every turn of the loop: replan if something
    /// relevant changed, pair waiting claims with idle slots, track the
    /// ready-set emptiness edge, and publish the status snapshot.
    fn drive(&mut self) {
        let now = Instant::now();

        let claimed = self.slots.values().filter(|s| s.is_claimed()).count();
        self.lowpass
            .observe(now, (claimed + self.queue.len()) as f64);
        if !self.queue.is_empty() {
            // claim pressure is a replan trigger: the demand envelope may
            // have raised the effective target
            self.needs_replan = true;
        }

        if self.needs_replan && matches!(self.state, PoolState::Running | PoolState::Failed) {
            self.needs_replan = false;
            self.replan(now);
        }

        self.service_queue(now);

        let has_ready = self
            .ready
            .iter()
            .any(|id| self.slots.get(id).is_some_and(|s| s.is_idle() && !s.unwanted));
        if self.ready_was_available && !has_ready {
            self.codel.note_empty(now);
        }
        self.ready_was_available = has_ready;

        self.publish_status();
    }

    // -------------------------------------------------------------------
    // claim intake and pairing

    fn handle_claim_request(&mut self, request: ClaimRequest<C>) {
        let now = Instant::now();
        let immediate_failure = match self.state {
            PoolState::Stopping | PoolState::Stopped => Some(ErrorKind::PoolStopping),
            PoolState::Failed => Some(ErrorKind::PoolFailed),
            _ if self.resolver_steady && !self.backends.values().any(|e| e.resolved) => {
                Some(ErrorKind::NoBackends)
            }
            _ => None,
        };
        if let Some(kind) = immediate_failure {
            let _ = request.reply.send(Err(kind.into()));
            return;
        }

        self.queue.push_back(WaitingClaim {
            reply: request.reply,
            enqueued_at: now,
            timeout_at: request.timeout.map(|t| now + t),
        });
    }

    /// Walk the queue in FIFO order, offering the head claim the first
    /// usable idle slot. The slot revalidates at handoff; a rejection keeps
    /// the claim at the head and discards the ready-set entry.
    fn service_queue(&mut self, now: Instant) {
        if self.state != PoolState::Running {
            return;
        }

        while !self.queue.is_empty() {
            let slot_id = match self.pop_ready() {
                Some(id) => id,
                None => break,
            };
            let waiting = self.queue.pop_front().expect("queue checked non-empty");

            if waiting.timeout_at.is_some_and(|t| now >= t) {
                let waited = now.saturating_duration_since(waiting.enqueued_at);
                let _ = waiting.fulfill(Err(Error::claim_timeout(waited)));
                self.ready.push_front(slot_id);
                continue;
            }

            let sojourn = now.saturating_duration_since(waiting.enqueued_at);
            if self.codel.observe(now, sojourn) {
                self.emitter.emit_claim_shed(sojourn);
                let _ = waiting.fulfill(Err(ErrorKind::Overloaded { sojourn }.into()));
                self.ready.push_front(slot_id);
                continue;
            }

            let slot = self.slots.get_mut(&slot_id).expect("ready entry validated");
            let (conn, _connection_id) = match slot.try_claim() {
                Some(pair) => pair,
                None => {
                    // rejected between selection and handoff; the claim
                    // returns to the head and the stale entry stays dropped
                    self.queue.push_front(waiting);
                    continue;
                }
            };
            let token = ReleaseToken::new(slot_id, slot.socket.generation());
            let backend = slot.backend.clone();
            let guard = Claim::new(conn, backend, token, self.manager.clone());
            if let Err(returned) = waiting.fulfill(Ok(guard)) {
                // The claimant cancelled between enqueue and pairing.
                // Dropping the guard routes the connection back through the
                // release path, re-idling the slot.
                drop(returned);
            }
        }
    }

    fn pop_ready(&mut self) -> Option<SlotId> {
        while let Some(id) = self.ready.pop_front() {
            if self
                .slots
                .get(&id)
                .is_some_and(|s| s.is_idle() && !s.unwanted)
            {
                return Some(id);
            }
        }
        None
    }

    fn drain_queue(&mut self, error: impl Fn() -> Error) {
        for waiting in self.queue.drain(..) {
            let _ = waiting.fulfill(Err(error()));
        }
    }

    // -------------------------------------------------------------------
    // management traffic

    fn handle_management(&mut self, message: PoolMessage<C>) {
        match message {
            PoolMessage::AttemptResolved {
                slot,
                generation,
                result,
            } => self.handle_attempt(slot, generation, result),
            PoolMessage::ConnectionClosed {
                slot,
                generation,
                error,
            } => self.handle_connection_closed(slot, generation, error),
            PoolMessage::Release {
                token,
                conn,
                flagged,
            } => self.handle_release(token, conn, flagged),
            PoolMessage::Stop(message) => {
                let ((), ack) = message.into_parts();
                self.begin_stop(Some(ack));
            }
        }
    }

    fn handle_attempt(
        &mut self,
        id: SlotId,
        generation: u64,
        result: Result<Established<C::Conn>>,
    ) {
        let now = Instant::now();
        if !self.slots.contains_key(&id) {
            // slot already torn down; an established transport is dropped,
            // which destroys it
            return;
        }

        match result {
            Ok(established) => {
                let (valid, unwanted, mode, backend) = {
                    let slot = self.slots.get_mut(&id).expect("checked above");
                    (
                        slot.socket.handle_success(generation),
                        slot.unwanted,
                        slot.mode,
                        slot.backend.clone(),
                    )
                };
                if !valid {
                    return;
                }
                if unwanted {
                    drop(established);
                    self.retire_slot(id, ConnectionClosedReason::Unwanted, None);
                    return;
                }
                match mode {
                    SlotMode::Monitor => {
                        // The probe served its purpose; the connection is not
                        // kept.
                        drop(established);
                        self.retire_slot(id, ConnectionClosedReason::Unwanted, None);
                        if let Some(entry) = self.backends.get_mut(&backend.key()) {
                            entry.dead = false;
                            entry.last_dead = None;
                        }
                        self.emitter.emit_backend_recovered(&backend);
                        self.needs_replan = true;
                        self.check_failed();
                    }
                    SlotMode::Normal => {
                        let connection_id = self.next_connection_id;
                        self.next_connection_id += 1;
                        let Established { conn, closed } = established;
                        let watch_generation = {
                            let slot = self.slots.get_mut(&id).expect("checked above");
                            slot.established(conn, connection_id, now);
                            slot.socket.generation()
                        };
                        self.spawn_close_watch(id, watch_generation, closed);
                        self.ready.push_back(id);
                        self.emitter.emit_connected(&backend, connection_id);
                    }
                }
            }
            Err(error) => {
                let directive = {
                    let slot = self.slots.get_mut(&id).expect("checked above");
                    slot.socket
                        .handle_failure(generation, now, error.is_timed_out_io())
                };
                match directive {
                    None => {}
                    Some(SocketDirective::Sleep { .. }) => {
                        let slot = &self.slots[&id];
                        tracing::debug!(
                            slot = id,
                            backend = %slot.backend,
                            attempt = slot.socket.current_attempt(),
                            %error,
                            "connection attempt failed; backing off"
                        );
                    }
                    Some(SocketDirective::Exhausted) => self.handle_exhausted(id, &error),
                    Some(SocketDirective::Attempt { .. }) => {
                        unreachable!("a failure never begins an attempt")
                    }
                }
            }
        }
    }

    fn handle_connection_closed(&mut self, id: SlotId, generation: u64, error: Error) {
        let claimed_connection = match self.slots.get_mut(&id) {
            Some(slot) if slot.socket.generation() == generation => match slot.state {
                SlotState::Claimed { connection_id } => {
                    slot.socket.closed();
                    Some((connection_id, slot.backend.clone()))
                }
                SlotState::Idle { .. } => {
                    slot.socket.closed();
                    None
                }
                SlotState::Starting => return,
            },
            _ => return,
        };

        match claimed_connection {
            Some((connection_id, backend)) => {
                // The claimant's connection died under it. The slot goes
                // away now; the eventual release will carry a stale token.
                self.emitter.emit_closed(
                    &backend,
                    connection_id,
                    ConnectionClosedReason::Error,
                    Some(error),
                );
                self.retire_slot(id, ConnectionClosedReason::Error, None);
            }
            None => {
                self.retire_slot(id, ConnectionClosedReason::Error, Some(error));
            }
        }
    }

    fn handle_release(&mut self, token: ReleaseToken, conn: C::Conn, flagged: Option<Error>) {
        enum Disposition {
            Reidle,
            Close(ConnectionClosedReason, Option<Error>, u64),
            Stale,
        }

        let now = Instant::now();
        let disposition = match self.slots.get(&token.slot) {
            Some(slot) if slot.socket.generation() == token.generation && slot.is_claimed() => {
                let connection_id = match slot.state {
                    SlotState::Claimed { connection_id } => connection_id,
                    _ => unreachable!("checked claimed"),
                };
                if flagged.is_some() {
                    Disposition::Close(ConnectionClosedReason::Error, flagged, connection_id)
                } else if slot.unwanted {
                    let reason = if self.is_stopping() {
                        ConnectionClosedReason::PoolStopped
                    } else {
                        ConnectionClosedReason::Unwanted
                    };
                    Disposition::Close(reason, None, connection_id)
                } else {
                    Disposition::Reidle
                }
            }
            _ => Disposition::Stale,
        };

        match disposition {
            Disposition::Reidle => {
                let slot = self.slots.get_mut(&token.slot).expect("matched above");
                slot.reidle(conn, now);
                self.ready.push_back(token.slot);
            }
            Disposition::Close(reason, error, connection_id) => {
                let backend = self.slots[&token.slot].backend.clone();
                drop(conn);
                self.emitter.emit_closed(&backend, connection_id, reason, error);
                self.retire_slot(token.slot, reason, None);
            }
            Disposition::Stale => {
                drop(conn);
                tracing::warn!(
                    slot = token.slot,
                    "discarding connection released with a stale token"
                );
            }
        }
    }

    // -------------------------------------------------------------------
    // membership and health

    fn handle_resolver(&mut self, change: ResolverChange) {
        match change {
            ResolverChange::Added(backend) => {
                let key = backend.key();
                let seq = self.next_backend_seq;
                let entry = self.backends.entry(key).or_insert_with(|| {
                    tracing::debug!(%backend, "backend added");
                    BackendEntry {
                        backend,
                        seq,
                        resolved: true,
                        dead: false,
                        last_dead: None,
                    }
                });
                if entry.seq == seq {
                    self.next_backend_seq += 1;
                }
                entry.resolved = true;
                if self.state == PoolState::Starting {
                    self.set_state(PoolState::Running);
                }
                self.needs_replan = true;
                self.check_failed();
            }
            ResolverChange::Removed(backend) => {
                let key = backend.key();
                tracing::debug!(%backend, "backend removed");
                if let Some(entry) = self.backends.get_mut(&key) {
                    entry.resolved = false;
                }
                for id in self.slots_for_backend(&key) {
                    self.set_unwanted(id);
                }
                if let Some(monitor) = self.monitors.get(&key).copied() {
                    self.retire_slot(monitor, ConnectionClosedReason::Unwanted, None);
                }
                self.prune_backend(&key);
                self.needs_replan = true;
                self.check_failed();
            }
            ResolverChange::Steady => {
                self.resolver_steady = true;
                if self.state == PoolState::Starting {
                    self.set_state(PoolState::Running);
                    self.needs_replan = true;
                }
                if !self.backends.values().any(|e| e.resolved) {
                    self.drain_queue(|| ErrorKind::NoBackends.into());
                }
            }
        }
    }

    /// A slot ran out of retries: mark its backend dead and kick off the
    /// monitor protocol.
    fn handle_exhausted(&mut self, id: SlotId, error: &Error) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        debug_assert_eq!(slot.mode, SlotMode::Normal, "monitors never exhaust");
        tracing::warn!(
            slot = id,
            backend = %slot.backend,
            attempts = slot.socket.current_attempt(),
            last_timeout = ?slot.socket.last_timeout(),
            last_delay = ?slot.socket.last_delay(),
            backend_overloaded = slot.socket.overloaded(),
            %error,
            "connection attempts exhausted"
        );

        let key = slot.backend_key.clone();
        self.needs_replan = true;

        let newly_dead = match self.backends.get_mut(&key) {
            Some(entry) if entry.resolved && !entry.dead => {
                entry.dead = true;
                entry.last_dead = Some(Instant::now());
                true
            }
            _ => false,
        };
        if newly_dead {
            self.emitter.emit_backend_dead(&slot.backend);
            for other in self.slots_for_backend(&key) {
                self.set_unwanted(other);
            }
        }
        self.prune_backend(&key);
        self.check_failed();
    }

    /// Enter or leave the failed state based on whether any known backend is
    /// still healthy.
    fn check_failed(&mut self) {
        let mut known = 0usize;
        let mut dead = 0usize;
        for entry in self.backends.values().filter(|e| e.resolved) {
            known += 1;
            if entry.dead {
                dead += 1;
            }
        }
        let all_dead = known > 0 && known == dead;

        match (self.state, all_dead) {
            (PoolState::Running, true) => {
                self.set_state(PoolState::Failed);
                self.drain_queue(|| ErrorKind::PoolFailed.into());
            }
            (PoolState::Failed, false) => {
                self.set_state(PoolState::Running);
                self.needs_replan = true;
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------
    // rebalancing

    fn replan(&mut self, now: Instant) {
        let mut entries: Vec<(&String, &BackendEntry)> = self
            .backends
            .iter()
            .filter(|(_, e)| e.resolved)
            .collect();
        entries.sort_by_key(|(_, e)| e.seq);

        let healthy: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !e.dead)
            .map(|(k, _)| (*k).clone())
            .collect();
        let dead: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.dead)
            .map(|(k, _)| (*k).clone())
            .collect();
        let monitored: BTreeSet<String> = self.monitors.keys().cloned().collect();
        let slots: Vec<_> = self
            .slots
            .values()
            .filter(|s| s.mode == SlotMode::Normal)
            .map(|s| s.view())
            .collect();

        let target = self
            .options
            .configured_target()
            .max(self.lowpass.target(now));

        let input = PlanInput {
            healthy,
            dead,
            monitored,
            slots,
            target,
            maximum: self.options.maximum,
        };

        for action in plan(&input) {
            match action {
                PlanAction::Create { backend } => {
                    self.create_slot(&backend, SlotMode::Normal, now);
                }
                PlanAction::CreateMonitor { backend } => {
                    self.create_slot(&backend, SlotMode::Monitor, now);
                }
                PlanAction::MarkUnwanted { slot } => self.set_unwanted(slot),
            }
        }
    }

    fn create_slot(&mut self, key: &str, mode: SlotMode, now: Instant) {
        let Some(entry) = self.backends.get(key) else {
            return;
        };
        // the plan may be momentarily behind reality
        if mode == SlotMode::Normal && entry.dead {
            return;
        }
        if mode == SlotMode::Monitor && self.monitors.contains_key(key) {
            return;
        }

        let backend = entry.backend.clone();
        let policy = self.options.recovery.policy("connect").clone();
        let base = BackoffSchedule::new(policy, self.options.max_chained_backoff);
        let socket = match mode {
            SlotMode::Normal => SocketMgr::new(base),
            SlotMode::Monitor => SocketMgr::new_monitor(base.monitor(self.options.check_timeout)),
        };

        let id = self.next_slot_id;
        self.next_slot_id += 1;
        let mut slot = Slot::new(id, backend.clone(), mode, socket);
        let directive = slot.socket.connect(now);
        if mode == SlotMode::Monitor {
            self.monitors.insert(key.to_string(), id);
            tracing::debug!(slot = id, %backend, "monitoring dead backend");
        }
        self.slots.insert(id, slot);

        match directive {
            SocketDirective::Attempt {
                generation,
                timeout,
            } => self.spawn_attempt(id, generation, timeout),
            SocketDirective::Sleep { .. } => {}
            SocketDirective::Exhausted => {
                // a zero-retry budget exhausts without attempting
                self.handle_exhausted(id, &Error::internal("retry budget is zero"));
            }
        }
    }

    fn set_unwanted(&mut self, id: SlotId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.unwanted {
            return;
        }
        slot.unwanted = true;
        if slot.is_claimed() {
            // drains when the claimant releases
            return;
        }
        let reason = if self.is_stopping() {
            ConnectionClosedReason::PoolStopped
        } else {
            ConnectionClosedReason::Unwanted
        };
        self.retire_slot(id, reason, None);
    }

    /// Remove a slot from every table. Emits the closed-connection event if
    /// the slot still held an idle connection.
    fn retire_slot(&mut self, id: SlotId, reason: ConnectionClosedReason, error: Option<Error>) {
        let Some(mut slot) = self.slots.remove(&id) else {
            return;
        };
        slot.socket.destroy();
        if slot.mode == SlotMode::Monitor {
            self.monitors.remove(&slot.backend_key);
        }
        if let Some((conn, connection_id)) = slot.take_idle() {
            drop(conn);
            self.emitter
                .emit_closed(&slot.backend, connection_id, reason, error);
        }
        self.prune_backend(&slot.backend_key);
        self.needs_replan = true;
    }

    fn slots_for_backend(&self, key: &str) -> Vec<SlotId> {
        self.slots
            .values()
            .filter(|s| s.mode == SlotMode::Normal && s.backend_key == key)
            .map(|s| s.id)
            .collect()
    }

    /// Drop a backend entry once the resolver has retracted it and no slot
    /// references it.
    fn prune_backend(&mut self, key: &str) {
        let referenced = self.slots.values().any(|s| s.backend_key == key)
            || self.monitors.contains_key(key);
        if referenced {
            return;
        }
        if self.backends.get(key).is_some_and(|e| !e.resolved) {
            self.backends.remove(key);
        }
    }

    // -------------------------------------------------------------------
    // attempts and close watches

    fn spawn_attempt(&self, id: SlotId, generation: u64, timeout: Duration) {
        let Some(slot) = self.slots.get(&id) else {
            return;
        };
        let backend = slot.backend.clone();
        let connector = self.connector.clone();
        let manager = self.manager.clone();
        runtime::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&backend)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
            };
            manager.attempt_resolved(id, generation, result);
        });
    }

    fn spawn_close_watch(&self, id: SlotId, generation: u64, closed: BoxFuture<'static, Error>) {
        let manager = self.manager.clone();
        runtime::spawn(async move {
            let error = closed.await;
            manager.connection_closed(id, generation, error);
        });
    }

    // -------------------------------------------------------------------
    // timers

    fn next_wake(&self) -> Instant {
        let mut wake = self.maintenance_at;
        if let Some(at) = self.decoherence_at {
            wake = wake.min(at);
        }
        for waiting in &self.queue {
            if let Some(at) = waiting.timeout_at {
                wake = wake.min(at);
            }
        }
        for slot in self.slots.values() {
            if let Some(at) = slot.socket.wake_at() {
                wake = wake.min(at);
            }
        }
        wake
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();

        // claim timeouts
        let mut index = 0;
        while index < self.queue.len() {
            if self.queue[index].timeout_at.is_some_and(|t| now >= t) {
                let waiting = self.queue.remove(index).expect("index in bounds");
                let waited = now.saturating_duration_since(waiting.enqueued_at);
                let _ = waiting.fulfill(Err(Error::claim_timeout(waited)));
            } else {
                index += 1;
            }
        }

        // backoff delays that have elapsed
        let due: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.socket.wake_at().is_some_and(|at| now >= at))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            let directive = match self.slots.get_mut(&id) {
                Some(slot) => slot.socket.poll_wake(now),
                None => None,
            };
            if let Some(SocketDirective::Attempt {
                generation,
                timeout,
            }) = directive
            {
                self.spawn_attempt(id, generation, timeout);
            }
        }

        if let (Some(interval), Some(at)) = (self.options.decoherence_interval, self.decoherence_at)
        {
            if now >= at {
                self.decohere();
                let period = interval / self.options.configured_target().max(1);
                self.decoherence_at = Some(now + period);
            }
        }

        if now >= self.maintenance_at {
            self.reclaim_idle(now);
            self.maintenance_at = now + MAINTENANCE_FREQUENCY;
        }
    }

    /// Recycle one randomly chosen idle connection so connection ages stay
    /// decorrelated across the pool.
    fn decohere(&mut self) {
        if !self.queue.is_empty() {
            return;
        }
        let candidates: Vec<SlotId> = self
            .slots
            .values()
            .filter(|s| s.mode == SlotMode::Normal && s.is_idle() && !s.unwanted)
            .map(|s| s.id)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let id = candidates[self.rng.random_range(0..candidates.len())];
        tracing::debug!(slot = id, "recycling idle connection");
        self.retire_slot(id, ConnectionClosedReason::Recycled, None);
    }

    /// Close idle connections that outlived the overload controller's
    /// ceiling, but only those above the configured floor; the demand
    /// envelope decaying is what shrinks the pool back down.
    fn reclaim_idle(&mut self, now: Instant) {
        let Some(max_idle) = self.codel.max_idle(now) else {
            return;
        };
        let live = self
            .slots
            .values()
            .filter(|s| s.mode == SlotMode::Normal)
            .count() as u32;
        let floor = self.options.configured_target().max(self.options.spares);
        let mut excess = live.saturating_sub(floor);
        if excess == 0 {
            return;
        }

        let mut expired: Vec<(Instant, SlotId)> = self
            .slots
            .values()
            .filter(|s| s.mode == SlotMode::Normal && !s.unwanted)
            .filter_map(|s| s.idle_since().map(|since| (since, s.id)))
            .filter(|(since, _)| *since + max_idle <= now)
            .collect();
        expired.sort();

        for (_, id) in expired {
            if excess == 0 {
                break;
            }
            excess -= 1;
            self.retire_slot(id, ConnectionClosedReason::Idle, None);
        }
    }

    // -------------------------------------------------------------------
    // stop

    fn begin_stop(&mut self, ack: Option<AcknowledgmentSender<()>>) {
        if let Some(ack) = ack {
            self.stop_acks.push(ack);
        }
        if self.is_stopping() {
            return;
        }
        self.set_state(PoolState::Stopping);
        self.resolver.stop();
        self.drain_queue(|| ErrorKind::PoolStopping.into());

        let ids: Vec<SlotId> = self.slots.keys().copied().collect();
        for id in ids {
            self.set_unwanted(id);
        }
    }

    // -------------------------------------------------------------------
    // observability

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            queued: self.queue.len(),
            ..PoolStats::default()
        };
        for entry in self.backends.values().filter(|e| e.resolved) {
            stats.backends += 1;
            if entry.dead {
                stats.dead_backends += 1;
            }
        }
        for slot in self.slots.values().filter(|s| s.mode == SlotMode::Normal) {
            stats.slots += 1;
            if slot.is_claimed() {
                stats.claimed += 1;
            } else if slot.is_idle() && !slot.unwanted {
                stats.ready += 1;
            }
        }
        stats
    }

    fn publish_status(&self) {
        let status = PoolStatus {
            state: self.state,
            stats: self.stats(),
        };
        if *self.status_tx.borrow() != status {
            let _ = self.status_tx.send(status);
        }
    }
}
