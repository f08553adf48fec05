//! Protocol-level tests against the in-memory store with a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use solo::coordination::memory::{MemoryLease, MemoryStore};
use solo::metrics::MetricsRegistry;
use solo::{
    ControllerState, Extension, LeaseCapability, LeaseConfig, LeaseController, LeaseHandle,
    LeaseRegistry, RunMode, WorkerError,
};

const KEY: &str = "solo:worker1";

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn timings(ttl: u64, ping: u64, restart: u64) -> LeaseConfig {
    LeaseConfig {
        ttl: ms(ttl),
        ping_interval: ms(ping),
        restart_interval: ms(restart),
    }
}

/// Wraps a lease and counts calls.
struct CountingLease {
    inner: MemoryLease,
    acquires: AtomicUsize,
    releases: AtomicUsize,
}

impl CountingLease {
    fn new(inner: MemoryLease) -> Arc<Self> {
        Arc::new(Self {
            inner,
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LeaseCapability for CountingLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(key, ttl).await
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<Extension> {
        self.inner.extend(key, ttl).await
    }

    async fn release(&self, key: &str) -> Result<bool> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(key).await
    }

    fn holder(&self) -> &str {
        self.inner.holder()
    }
}

/// Worker that reports the instant it was invoked, then finishes at once.
fn reporting_worker(
    tx: mpsc::UnboundedSender<Instant>,
) -> impl Fn(Option<WorkerError>, LeaseHandle) + Send + Sync + 'static {
    move |_err: Option<WorkerError>, handle: LeaseHandle| {
        let _ = tx.send(Instant::now());
        handle.done();
    }
}

/// Worker that hands its lease handle to the test.
fn handing_worker(
    tx: mpsc::UnboundedSender<LeaseHandle>,
) -> impl Fn(Option<WorkerError>, LeaseHandle) + Send + Sync + 'static {
    move |_err: Option<WorkerError>, handle: LeaseHandle| {
        let _ = tx.send(handle);
    }
}

#[tokio::test(start_paused = true)]
async fn second_process_polls_until_first_releases() {
    let store = MemoryStore::new();
    let config = timings(200, 50, 0);
    let t0 = Instant::now();

    let a_lease = CountingLease::new(store.lease("a"));
    let a = LeaseController::builder("worker1")
        .lease(a_lease.clone())
        .lease_config(config)
        .mode(RunMode::OneShot)
        .registry(LeaseRegistry::new())
        .worker(|_err: Option<WorkerError>, handle: LeaseHandle| {
            tokio::spawn(async move {
                sleep(ms(120)).await;
                handle.done();
            });
        })
        .build()
        .unwrap()
        .start();

    sleep(ms(10)).await;
    assert_eq!(store.holder_of(KEY).as_deref(), Some("a"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let b_lease = CountingLease::new(store.lease("b"));
    let b = LeaseController::builder("worker1")
        .lease(b_lease.clone())
        .lease_config(config)
        .mode(RunMode::OneShot)
        .registry(LeaseRegistry::new())
        .worker(reporting_worker(tx))
        .build()
        .unwrap()
        .start();

    let b_at = rx.recv().await.unwrap();
    let waited = b_at - t0;
    // A released at 120ms; B polls at 10, 60, 110 and wins at 160.
    assert!(waited >= ms(120), "B ran at {waited:?}, before A released");
    assert!(waited <= ms(170), "B ran at {waited:?}, more than one ping after release");
    assert!(b_lease.acquires() >= 3, "B attempted {} times", b_lease.acquires());
    assert_eq!(a_lease.acquires(), 1);

    a.join().await.unwrap();
    b.join().await.unwrap();
    assert!(store.holder_of(KEY).is_none());
}

#[tokio::test(start_paused = true)]
async fn uncontested_process_acquires_immediately() {
    let store = MemoryStore::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let t0 = Instant::now();

    let task = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .mode(RunMode::OneShot)
        .registry(LeaseRegistry::new())
        .worker(reporting_worker(tx))
        .build()
        .unwrap()
        .start();

    let at = rx.recv().await.unwrap();
    assert!(at - t0 <= LeaseConfig::default().ping_interval);
    task.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn at_most_one_worker_in_flight() {
    let store = MemoryStore::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let episodes = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for holder in ["a", "b", "c"] {
        let in_flight = Arc::clone(&in_flight);
        let max_in_flight = Arc::clone(&max_in_flight);
        let episodes = Arc::clone(&episodes);
        let task = LeaseController::builder("worker1")
            .lease(Arc::new(store.lease(holder)))
            .lease_config(timings(100, 10, 30))
            .registry(LeaseRegistry::new())
            .worker(move |_err: Option<WorkerError>, handle: LeaseHandle| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                episodes.fetch_add(1, Ordering::SeqCst);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    sleep(ms(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    handle.done();
                });
            })
            .build()
            .unwrap()
            .start();
        tasks.push(task);
    }

    sleep(ms(1000)).await;
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert!(episodes.load(Ordering::SeqCst) >= 10);
}

#[tokio::test(start_paused = true)]
async fn one_shot_processes_run_one_after_another() {
    let store = MemoryStore::new();
    let spans: Arc<Mutex<Vec<(&'static str, Instant, Instant)>>> = Arc::default();

    let mut tasks = Vec::new();
    for holder in ["a", "b", "c"] {
        let spans = Arc::clone(&spans);
        let task = LeaseController::builder("worker1")
            .lease(Arc::new(store.lease(holder)))
            .lease_config(timings(100, 25, 0))
            .mode(RunMode::OneShot)
            .registry(LeaseRegistry::new())
            .worker(move |_err: Option<WorkerError>, handle: LeaseHandle| {
                let spans = Arc::clone(&spans);
                tokio::spawn(async move {
                    let start = Instant::now();
                    sleep(ms(60)).await;
                    spans.lock().unwrap().push((holder, start, Instant::now()));
                    handle.done();
                });
            })
            .build()
            .unwrap()
            .start();
        tasks.push(task);
    }

    for task in tasks {
        task.join().await.unwrap();
    }

    let mut spans = spans.lock().unwrap().clone();
    assert_eq!(spans.len(), 3);
    spans.sort_by_key(|(_, start, _)| *start);
    for pair in spans.windows(2) {
        assert!(pair[0].2 <= pair[1].1, "episodes overlap: {:?}", pair);
    }
}

#[tokio::test(start_paused = true)]
async fn crashed_holder_blocks_for_at_most_one_ttl() {
    let store = MemoryStore::new();
    let config = timings(200, 50, 0);
    let t0 = Instant::now();

    // A's worker never finishes and never touches: as far as the store can
    // tell, A is gone.
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let lapses = Arc::new(Mutex::new(Vec::new()));
    let lapses_hook = Arc::clone(&lapses);
    let metrics = MetricsRegistry::new();
    let a = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .lease_config(config)
        .registry(LeaseRegistry::new())
        .metrics(metrics.clone())
        .on_lease_lapsed(move |event| lapses_hook.lock().unwrap().push((event, Instant::now())))
        .worker(handing_worker(held_tx))
        .build()
        .unwrap()
        .start();
    let _a_handle = held_rx.recv().await.unwrap();

    sleep(ms(10)).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _b = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("b")))
        .lease_config(config)
        .registry(LeaseRegistry::new())
        .worker(reporting_worker(tx))
        .build()
        .unwrap()
        .start();

    let b_at = rx.recv().await.unwrap();
    assert!(b_at - t0 >= ms(200));
    assert!(b_at - t0 <= ms(250));

    // Silent handoff: A is still waiting for done(), but the lapse was reported.
    assert_eq!(a.state(), ControllerState::Active);
    let lapses = lapses.lock().unwrap().clone();
    assert_eq!(lapses.len(), 1);
    assert_eq!(lapses[0].0.key, KEY);
    assert_eq!(lapses[0].0.episode, 1);
    assert_eq!(lapses[0].1 - t0, ms(200));
    assert!(metrics.encode().unwrap().contains("solo_lease_lapsed_total 1"));
}

#[tokio::test(start_paused = true)]
async fn touching_worker_never_lapses() {
    let store = MemoryStore::new();
    let lapses = Arc::new(AtomicUsize::new(0));
    let lapses_hook = Arc::clone(&lapses);
    let extended = Arc::new(AtomicUsize::new(0));
    let extended_worker = Arc::clone(&extended);

    let task = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .lease_config(timings(100, 50, 0))
        .mode(RunMode::OneShot)
        .registry(LeaseRegistry::new())
        .on_lease_lapsed(move |_| {
            lapses_hook.fetch_add(1, Ordering::SeqCst);
        })
        .worker(move |_err: Option<WorkerError>, handle: LeaseHandle| {
            let extended = Arc::clone(&extended_worker);
            tokio::spawn(async move {
                for _ in 0..10 {
                    sleep(ms(50)).await;
                    if handle.touch().await == Extension::Extended {
                        extended.fetch_add(1, Ordering::SeqCst);
                    }
                }
                handle.done();
            });
        })
        .build()
        .unwrap()
        .start();

    // A competitor never gets in while the worker keeps touching.
    sleep(ms(5)).await;
    let b = store.lease("b");
    for _ in 0..9 {
        assert!(!b.acquire(KEY, ms(100)).await.unwrap());
        sleep(ms(50)).await;
    }

    task.join().await.unwrap();
    assert_eq!(extended.load(Ordering::SeqCst), 10);
    assert_eq!(lapses.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn termination_releases_without_waiting_for_ttl() {
    let store = MemoryStore::new();
    let registry_a = LeaseRegistry::new();

    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let a = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .lease_config(timings(10_000, 50, 0))
        .registry(registry_a.clone())
        .worker(handing_worker(held_tx))
        .build()
        .unwrap()
        .start();
    let a_handle = held_rx.recv().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _b = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("b")))
        .lease_config(timings(10_000, 50, 0))
        .registry(LeaseRegistry::new())
        .worker(reporting_worker(tx))
        .build()
        .unwrap()
        .start();

    sleep(ms(100)).await;
    assert_eq!(registry_a.held_keys(), vec![KEY.to_string()]);
    let released_at = Instant::now();
    assert_eq!(registry_a.release_all().await, 1);

    let b_at = rx.recv().await.unwrap();
    assert!(b_at - released_at <= ms(50));

    // A stops instead of competing again, and its stale handle is inert.
    a.join().await.unwrap();
    a_handle.done();
    assert_eq!(store.holder_of(KEY).as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn termination_waits_for_a_worker_that_listens_for_it() {
    let store = MemoryStore::new();
    let registry = LeaseRegistry::new();
    let stopped_at: Arc<Mutex<Option<Instant>>> = Arc::default();
    let stopped_worker = Arc::clone(&stopped_at);

    let task = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .lease_config(timings(10_000, 50, 0))
        .registry(registry.clone())
        .worker(move |_err: Option<WorkerError>, handle: LeaseHandle| {
            let stopped_at = Arc::clone(&stopped_worker);
            tokio::spawn(async move {
                let Some(mut shutdown) = handle.on_shutdown() else {
                    handle.done();
                    return;
                };
                shutdown.recv().await;
                // Simulated teardown of in-flight work.
                sleep(ms(30)).await;
                *stopped_at.lock().unwrap() = Some(Instant::now());
                handle.done();
            });
        })
        .build()
        .unwrap()
        .start();

    sleep(ms(100)).await;
    let began = Instant::now();
    let releasing = tokio::spawn({
        let registry = registry.clone();
        async move { registry.release_all().await }
    });

    // Still held while the worker tears down.
    sleep(ms(10)).await;
    assert_eq!(store.holder_of(KEY).as_deref(), Some("a"));
    assert!(!store.lease("b").acquire(KEY, ms(1000)).await.unwrap());

    assert_eq!(releasing.await.unwrap(), 1);
    let released_at = Instant::now();
    let stopped = stopped_at.lock().unwrap().unwrap();
    assert_eq!(stopped - began, ms(30));
    assert!(stopped <= released_at);
    assert!(store.holder_of(KEY).is_none());
    task.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn closed_registry_stops_a_waiting_controller() {
    let store = MemoryStore::new();
    assert!(store.lease("other").acquire(KEY, ms(10_000)).await.unwrap());

    let registry = LeaseRegistry::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_worker = Arc::clone(&ran);
    let task = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .lease_config(timings(1000, 1000, 0))
        .registry(registry.clone())
        .worker(move |_err: Option<WorkerError>, handle: LeaseHandle| {
            ran_worker.fetch_add(1, Ordering::SeqCst);
            handle.done();
        })
        .build()
        .unwrap()
        .start();

    sleep(ms(100)).await;
    assert_eq!(task.state(), ControllerState::Acquiring);
    let closed_at = Instant::now();
    assert_eq!(registry.release_all().await, 0);
    task.join().await.unwrap();

    // Woken by the close, not by the next ping.
    assert!(Instant::now() - closed_at < ms(1000));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_interval_paces_episodes() {
    let store = MemoryStore::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _task = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .lease_config(timings(1000, 50, 100))
        .registry(LeaseRegistry::new())
        .worker(reporting_worker(tx))
        .build()
        .unwrap()
        .start();

    let first = rx.recv().await.unwrap();

    // The lease is kept through the cool-down so nobody else slips in.
    sleep(ms(50)).await;
    assert_eq!(store.holder_of(KEY).as_deref(), Some("a"));
    assert!(!store.lease("b").acquire(KEY, ms(1000)).await.unwrap());

    let second = rx.recv().await.unwrap();
    let gap = second - first;
    assert!(gap >= ms(100), "restarted after {gap:?}");
    assert!(gap <= ms(150), "restarted after {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_is_retried_like_contention() {
    let store = MemoryStore::new();
    store.set_available(false);
    let lease = CountingLease::new(store.lease("a"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let metrics = MetricsRegistry::new();

    let task = LeaseController::builder("worker1")
        .lease(lease.clone())
        .lease_config(timings(1000, 50, 0))
        .mode(RunMode::OneShot)
        .registry(LeaseRegistry::new())
        .metrics(metrics.clone())
        .worker(reporting_worker(tx))
        .build()
        .unwrap()
        .start();

    sleep(ms(220)).await;
    assert_eq!(task.state(), ControllerState::Acquiring);
    let restored_at = Instant::now();
    store.set_available(true);

    let at = rx.recv().await.unwrap();
    assert!(at - restored_at <= ms(50));
    assert!(lease.acquires() >= 5);
    task.join().await.unwrap();
    assert!(metrics.encode().unwrap().contains("solo_store_errors_total 5"));
}

#[tokio::test(start_paused = true)]
async fn repeated_done_releases_once() {
    let store = MemoryStore::new();
    let lease = CountingLease::new(store.lease("a"));

    let task = LeaseController::builder("worker1")
        .lease(lease.clone())
        .mode(RunMode::OneShot)
        .registry(LeaseRegistry::new())
        .worker(|_err: Option<WorkerError>, handle: LeaseHandle| {
            handle.done();
            handle.done();
            handle.clone().done();
        })
        .build()
        .unwrap()
        .start();

    task.join().await.unwrap();
    assert_eq!(lease.acquires(), 1);
    assert_eq!(lease.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn states_follow_the_episode() {
    let store = MemoryStore::new();
    let registry = LeaseRegistry::new();
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();

    let mut task = LeaseController::builder("worker1")
        .lease(Arc::new(store.lease("a")))
        .lease_config(timings(1000, 50, 100))
        .mode(RunMode::OneShot)
        .registry(registry.clone())
        .worker(handing_worker(held_tx))
        .build()
        .unwrap()
        .start();
    assert_eq!(task.key(), KEY);
    let observer = task.subscribe();

    task.wait_for(ControllerState::Active).await.unwrap();
    let handle = held_rx.recv().await.unwrap();
    assert_eq!(handle.episode(), 1);
    assert_eq!(handle.key(), KEY);
    assert_eq!(registry.held_keys(), vec![KEY.to_string()]);

    handle.done();
    task.wait_for(ControllerState::Releasing).await.unwrap();
    assert!(!handle.is_live());
    assert_eq!(handle.touch().await, Extension::Stale);

    task.wait_for(ControllerState::Terminated).await.unwrap();
    assert!(registry.held_keys().is_empty());
    assert!(store.holder_of(KEY).is_none());
    task.join().await.unwrap();
    assert_eq!(*observer.borrow(), ControllerState::Terminated);
}
