use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{
    backoff::{Recovery, RecoveryPolicy},
    conn::{Connect, Established},
    error::{Error, Result},
    event::PoolEventHandler,
    options::{Backend, ClaimOptions, CodelOptions, OverloadOptions, PoolOptions},
    resolver::{BackendSink, Resolver, StaticResolver},
    Pool, PoolState,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn settle() {
    tokio::time::sleep(ms(10)).await;
}

/// Poll `condition` every 10ms of virtual time, panicking if it never holds.
async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(ms(10)).await;
    }
    panic!("never reached: {}", what);
}

// -----------------------------------------------------------------------
// scripted connector

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug)]
struct MockConn {
    id: u64,
    backend: Backend,
}

#[derive(Default)]
struct MockState {
    script: Mutex<HashMap<String, VecDeque<Outcome>>>,
    attempts: Mutex<Vec<(String, Instant)>>,
    kills: Mutex<HashMap<u64, oneshot::Sender<Error>>>,
}

/// Connector whose per-backend outcomes are scripted by the test. Once a
/// backend's script runs dry every attempt succeeds.
#[derive(Clone, Default)]
struct MockConnector {
    next_id: Arc<AtomicU64>,
    state: Arc<MockState>,
}

impl MockConnector {
    fn script(&self, backend: &Backend, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state
            .script
            .lock()
            .unwrap()
            .entry(backend.key())
            .or_default()
            .extend(outcomes);
    }

    /// Trigger the close watch of every connection established so far.
    fn kill_all(&self) {
        for (_, killer) in self.state.kills.lock().unwrap().drain() {
            let _ = killer.send(Error::connection_lost("killed by test"));
        }
    }

    fn attempts_for(&self, backend: &Backend) -> Vec<Instant> {
        let key = backend.key();
        self.state
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Connect for MockConnector {
    type Conn = MockConn;

    async fn connect(&self, backend: &Backend) -> Result<Established<MockConn>> {
        let key = backend.key();
        self.state
            .attempts
            .lock()
            .unwrap()
            .push((key.clone(), Instant::now()));

        let outcome = self
            .state
            .script
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Outcome::Succeed);

        match outcome {
            Outcome::Succeed => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let (killer, killed) = oneshot::channel();
                self.state.kills.lock().unwrap().insert(id, killer);
                Ok(Established::new(
                    MockConn {
                        id,
                        backend: backend.clone(),
                    },
                    async move {
                        match killed.await {
                            Ok(error) => error,
                            // killer dropped at test teardown; never resolve
                            Err(_) => std::future::pending().await,
                        }
                    },
                ))
            }
            Outcome::Fail => Err(Error::connect("scripted refusal")),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

// -----------------------------------------------------------------------
// membership the test can edit after startup

#[derive(Clone)]
struct TestResolver(Arc<TestResolverState>);

struct TestResolverState {
    initial: Vec<Backend>,
    sink: Mutex<Option<BackendSink>>,
}

impl TestResolver {
    fn new(initial: Vec<Backend>) -> Self {
        Self(Arc::new(TestResolverState {
            initial,
            sink: Mutex::new(None),
        }))
    }

    fn add(&self, backend: Backend) {
        if let Some(sink) = self.0.sink.lock().unwrap().as_ref() {
            sink.added(backend);
        }
    }

    fn remove(&self, backend: Backend) {
        if let Some(sink) = self.0.sink.lock().unwrap().as_ref() {
            sink.removed(backend);
        }
    }
}

impl Resolver for TestResolver {
    fn start(&self, sink: BackendSink) {
        for backend in &self.0.initial {
            sink.added(backend.clone());
        }
        sink.steady();
        *self.0.sink.lock().unwrap() = Some(sink);
    }
}

// -----------------------------------------------------------------------
// event capture

#[derive(Default)]
struct EventLog {
    entries: Mutex<Vec<String>>,
}

impl EventLog {
    fn push(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains(needle))
    }
}

impl PoolEventHandler for EventLog {
    fn handle_state_changed_event(&self, event: crate::event::PoolStateChangedEvent) {
        self.push(format!("state:{}->{}", event.previous, event.state));
    }

    fn handle_connected_to_backend_event(&self, event: crate::event::ConnectedToBackendEvent) {
        self.push(format!("connected:{}", event.backend));
    }

    fn handle_closed_connection_event(&self, event: crate::event::ClosedConnectionEvent) {
        self.push(format!("closed:{}:{:?}", event.backend, event.reason));
    }

    fn handle_backend_dead_event(&self, event: crate::event::BackendDeadEvent) {
        self.push(format!("dead:{}", event.backend));
    }

    fn handle_backend_recovered_event(&self, event: crate::event::BackendRecoveredEvent) {
        self.push(format!("recovered:{}", event.backend));
    }

    fn handle_claim_shed_event(&self, event: crate::event::ClaimShedEvent) {
        self.push(format!("shed:{:?}", event.sojourn));
    }
}

// -----------------------------------------------------------------------
// helpers

fn backend_a() -> Backend {
    Backend::new("a.example.com", 100)
}

fn backend_b() -> Backend {
    Backend::new("b.example.com", 200)
}

fn recovery(retries: u32) -> Recovery {
    Recovery::with_default(RecoveryPolicy::new(retries, ms(1000), ms(100)))
}

fn options(spares: u32, maximum: u32) -> PoolOptions {
    PoolOptions::builder()
        .spares(spares)
        .maximum(maximum)
        .recovery(recovery(3))
        .build()
}

fn pool_with(
    options: PoolOptions,
    backends: Vec<Backend>,
    connector: &MockConnector,
) -> Pool<MockConnector> {
    Pool::start(options, StaticResolver::new(backends), connector.clone()).unwrap()
}

// -----------------------------------------------------------------------
// scenarios

#[tokio::test(start_paused = true)]
async fn single_backend_happy_path() {
    let connector = MockConnector::default();
    let pool = pool_with(options(2, 4), vec![backend_a()], &connector);

    pool.wait_for_state(PoolState::Running).await;
    wait_until("two warm connections", || pool.stats().ready == 2).await;

    let first = pool.claim().await.unwrap();
    let second = pool.claim().await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.backend(), &backend_a());
    assert_eq!(pool.stats().claimed, 2);

    let third = tokio::spawn({
        let pool = pool.clone();
        async move { pool.claim().await }
    });
    settle().await;

    drop(first);
    let third = third.await.unwrap().unwrap();
    assert_eq!(third.backend(), &backend_a());

    // population stays within bounds throughout
    let stats = pool.stats();
    assert!(stats.ready + stats.claimed <= stats.slots);
    assert!(stats.slots <= 4);
}

#[tokio::test(start_paused = true)]
async fn retries_follow_the_backoff_schedule() {
    let connector = MockConnector::default();
    connector.script(&backend_a(), [Outcome::Fail, Outcome::Fail]);
    let pool = pool_with(options(1, 1), vec![backend_a()], &connector);

    wait_until("slot connects on the third attempt", || {
        pool.stats().ready == 1
    })
    .await;

    let attempts = connector.attempts_for(&backend_a());
    assert_eq!(attempts.len(), 3);
    // failures are instant, so the attempt spacing is exactly the delay
    // schedule: 100ms then 200ms
    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap >= ms(100) && first_gap < ms(150), "{first_gap:?}");
    assert!(second_gap >= ms(200) && second_gap < ms(250), "{second_gap:?}");
}

#[tokio::test(start_paused = true)]
async fn exhaustion_marks_backend_dead_and_monitor_recovers_it() {
    let connector = MockConnector::default();
    // one slot's budget (3 attempts) plus five monitor probes fail before
    // the backend comes back
    connector.script(&backend_a(), vec![Outcome::Fail; 8]);
    let log = Arc::new(EventLog::default());
    let opts = PoolOptions::builder()
        .spares(2)
        .maximum(4)
        .recovery(recovery(3))
        .event_handler(log.clone())
        .build();
    let pool = Pool::start(
        opts,
        StaticResolver::new(vec![backend_a(), backend_b()]),
        connector.clone(),
    )
    .unwrap();

    wait_until("backend marked dead", || pool.stats().dead_backends == 1).await;
    assert!(log.contains("dead:a.example.com:100"));

    // the healthy backend absorbs the lost capacity
    wait_until("replacement slots on the healthy backend", || {
        pool.stats().ready == 2
    })
    .await;
    let one = pool.claim().await.unwrap();
    let two = pool.claim().await.unwrap();
    assert_eq!(one.backend(), &backend_b());
    assert_eq!(two.backend(), &backend_b());
    drop(one);
    drop(two);

    // monitor probes run on the frozen final schedule until one lands
    wait_until("backend recovers", || pool.stats().dead_backends == 0).await;
    assert!(log.contains("recovered:a.example.com:100"));

    // the recovered backend rejoins the distribution
    wait_until("connections reach the recovered backend", || {
        log.contains("connected:a.example.com:100")
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn total_failure_fails_the_pool_until_a_monitor_reconnects() {
    let connector = MockConnector::default();
    connector.script(&backend_a(), vec![Outcome::Fail; 6]);
    let opts = PoolOptions::builder()
        .spares(1)
        .maximum(2)
        .recovery(recovery(2))
        .build();
    let pool = pool_with(opts, vec![backend_a()], &connector);

    // queued before the backend dies
    let queued_one = tokio::spawn({
        let pool = pool.clone();
        async move { pool.claim().await }
    });
    let queued_two = tokio::spawn({
        let pool = pool.clone();
        async move { pool.claim().await }
    });

    pool.wait_for_state(PoolState::Failed).await;
    assert!(queued_one.await.unwrap().unwrap_err().is_pool_failed());
    assert!(queued_two.await.unwrap().unwrap_err().is_pool_failed());

    // a claim against a failed pool fails outright
    assert!(pool.claim().await.unwrap_err().is_pool_failed());

    pool.wait_for_state(PoolState::Running).await;
    let claim = pool.claim().await.unwrap();
    assert_eq!(claim.backend(), &backend_a());
}

#[tokio::test(start_paused = true)]
async fn modified_codel_sheds_stale_claims_under_backlog() {
    let connector = MockConnector::default();
    let opts = PoolOptions::builder()
        .spares(1)
        .maximum(1)
        .recovery(recovery(3))
        .overload(OverloadOptions::ModifiedCodel(CodelOptions::default()))
        .build();
    let pool = pool_with(opts, vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let held = pool.claim().await.unwrap();

    // a backlog forms behind the single connection
    let mut backlog = Vec::new();
    for _ in 0..6 {
        backlog.push(tokio::spawn({
            let pool = pool.clone();
            async move {
                let claim = pool.claim().await?;
                tokio::time::sleep(ms(150)).await;
                drop(claim);
                Ok::<_, Error>(())
            }
        }));
        settle().await;
    }

    // the connection frees up only after the queue has aged well past the
    // target delay
    tokio::time::sleep(ms(1100)).await;
    drop(held);

    let mut served = 0;
    let mut shed = 0;
    for outcome in futures::future::join_all(backlog).await {
        match outcome.unwrap() {
            Ok(()) => served += 1,
            Err(error) => {
                assert!(error.is_overloaded(), "{error}");
                shed += 1;
            }
        }
    }
    // the first queued claim pairs before the controller trips; the rest
    // have sojourns past twice the target and are shed
    assert_eq!(served, 1);
    assert_eq!(shed, 5);

    // fresh claims with low sojourn are served even while the flag decays
    tokio::time::sleep(ms(300)).await;
    let after = pool.claim().await.unwrap();
    drop(after);
}

#[tokio::test(start_paused = true)]
async fn a_connection_dying_between_offers_is_replaced() {
    let connector = MockConnector::default();
    let pool = pool_with(options(1, 2), vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let first = pool.claim().await.unwrap();
    let first_id = first.id;
    drop(first);
    settle().await;

    // the idle connection dies just as a claim arrives; the death is
    // processed first, the pairing is refused, and a replacement slot
    // serves the claim
    connector.kill_all();
    let replacement = pool.claim().await.unwrap();
    assert_ne!(replacement.id, first_id);
}

#[tokio::test(start_paused = true)]
async fn claims_are_served_in_fifo_order() {
    let connector = MockConnector::default();
    let pool = pool_with(options(1, 1), vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let held = pool.claim().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for label in ["first", "second", "third"] {
        waiters.push(tokio::spawn({
            let pool = pool.clone();
            let order = order.clone();
            async move {
                let claim = pool.claim().await.unwrap();
                order.lock().unwrap().push(label);
                drop(claim);
            }
        }));
        settle().await;
    }

    drop(held);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn waiting_claims_time_out() {
    let connector = MockConnector::default();
    let pool = pool_with(options(1, 1), vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let held = pool.claim().await.unwrap();

    let started = Instant::now();
    let error = pool
        .claim_with(ClaimOptions::builder().timeout(ms(500)).build())
        .await
        .unwrap_err();
    assert!(error.is_claim_timeout(), "{error}");
    let waited = Instant::now() - started;
    assert!(waited >= ms(500) && waited < ms(600), "{waited:?}");

    drop(held);
}

#[tokio::test(start_paused = true)]
async fn cancelled_claims_return_the_offer_to_the_pool() {
    let connector = MockConnector::default();
    let pool = pool_with(options(1, 1), vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let held = pool.claim().await.unwrap();

    // drop the pending claim future before it can be paired
    {
        let claim_future = pool.claim();
        tokio::select! {
            biased;
            _ = tokio::time::sleep(ms(50)) => {}
            _ = claim_future => panic!("no connection should be available"),
        }
    }

    drop(held);
    wait_until("connection returns to the ready set", || {
        let stats = pool.stats();
        stats.ready == 1 && stats.queued == 0
    })
    .await;

    // the cancelled claim did not strand the connection
    let next = pool.claim().await.unwrap();
    drop(next);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_queued_claims_and_waits_for_claimants() {
    let connector = MockConnector::default();
    let pool = pool_with(options(1, 1), vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let held = pool.claim().await.unwrap();
    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.claim().await }
    });
    settle().await;

    let stopper = tokio::spawn({
        let pool = pool.clone();
        async move { pool.stop().await }
    });

    assert!(queued.await.unwrap().unwrap_err().is_pool_stopping());
    settle().await;
    assert_eq!(pool.state(), PoolState::Stopping);

    // new claims are refused while draining
    assert!(pool.claim().await.unwrap_err().is_pool_stopping());

    drop(held);
    stopper.await.unwrap();
    assert_eq!(pool.state(), PoolState::Stopped);

    // stopping again is a no-op
    pool.stop().await;
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn steady_state_with_no_backends_fails_claims() {
    let connector = MockConnector::default();
    let pool = pool_with(options(1, 2), vec![], &connector);

    pool.wait_for_state(PoolState::Running).await;
    assert!(pool.claim().await.unwrap_err().is_no_backends());
}

#[tokio::test(start_paused = true)]
async fn removed_backend_is_retained_until_its_claimant_releases() {
    let connector = MockConnector::default();
    let resolver = TestResolver::new(vec![backend_a()]);
    let log = Arc::new(EventLog::default());
    let opts = PoolOptions::builder()
        .spares(1)
        .maximum(2)
        .recovery(recovery(3))
        .event_handler(log.clone())
        .build();
    let pool = Pool::start(opts, resolver.clone(), connector.clone()).unwrap();

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let held = pool.claim().await.unwrap();

    resolver.remove(backend_a());
    wait_until("membership empties", || pool.stats().backends == 0).await;

    // the claimed connection keeps working; the slot drains at release
    assert_eq!(held.backend(), &backend_a());
    drop(held);
    wait_until("slot drains", || pool.stats().slots == 0).await;
    assert!(log.contains("closed:a.example.com:100:Unwanted"));

    assert!(pool.claim().await.unwrap_err().is_no_backends());

    // membership coming back revives the pool
    resolver.add(backend_a());
    wait_until("warm connection returns", || pool.stats().ready == 1).await;
    let claim = pool.claim().await.unwrap();
    drop(claim);
}

#[tokio::test(start_paused = true)]
async fn released_connections_flagged_with_errors_are_destroyed() {
    let connector = MockConnector::default();
    let log = Arc::new(EventLog::default());
    let opts = PoolOptions::builder()
        .spares(1)
        .maximum(2)
        .recovery(recovery(3))
        .event_handler(log.clone())
        .build();
    let pool = Pool::start(opts, StaticResolver::new(vec![backend_a()]), connector.clone())
        .unwrap();

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let claim = pool.claim().await.unwrap();
    let poisoned = claim.id;
    claim.release_err(Error::connection_lost("application saw a broken pipe"));

    wait_until("replacement connection", || pool.stats().ready == 1).await;
    assert!(log.contains("closed:a.example.com:100:Error"));

    let replacement = pool.claim().await.unwrap();
    assert_ne!(replacement.id, poisoned);
}

#[tokio::test(start_paused = true)]
async fn an_idle_connection_dying_is_replaced() {
    let connector = MockConnector::default();
    let pool = pool_with(options(2, 4), vec![backend_a()], &connector);

    wait_until("two warm connections", || pool.stats().ready == 2).await;
    connector.kill_all();

    wait_until("replacements connect", || {
        let stats = pool.stats();
        stats.ready == 2 && stats.slots == 2
    })
    .await;
    let claim = pool.claim().await.unwrap();
    assert!(claim.id > 2);
}

#[tokio::test(start_paused = true)]
async fn decoherence_recycles_idle_connections() {
    let connector = MockConnector::default();
    let opts = PoolOptions::builder()
        .spares(1)
        .maximum(2)
        .recovery(recovery(3))
        .decoherence_interval(ms(300))
        .build();
    let pool = pool_with(opts, vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let first = pool.claim().await.unwrap();
    let first_id = first.id;
    drop(first);

    tokio::time::sleep(ms(1000)).await;
    wait_until("a recycled replacement is ready", || pool.stats().ready == 1).await;

    let later = pool.claim().await.unwrap();
    assert!(later.id > first_id, "connection was never recycled");
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_is_rejected_at_start() {
    let connector = MockConnector::default();
    let error = Pool::start(
        PoolOptions::builder().spares(4).maximum(2).build(),
        StaticResolver::new(vec![backend_a()]),
        connector,
    )
    .unwrap_err();
    assert!(error.to_string().contains("maximum"));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_pool_handle_stops_the_worker() {
    let connector = MockConnector::default();
    let pool = pool_with(options(1, 1), vec![backend_a()], &connector);

    wait_until("warm connection", || pool.stats().ready == 1).await;
    let status = pool.status.clone();
    drop(pool);

    let mut status = status;
    wait_until("worker winds down", || {
        status.borrow_and_update().state == PoolState::Stopped
    })
    .await;
}
