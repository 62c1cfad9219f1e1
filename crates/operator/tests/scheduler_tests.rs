use async_trait::async_trait;
use parking_lot::Mutex;
use pgwarden_core::{Cluster, ClusterPhase, ClusterSpec};
use pgwarden_operator::scheduler::{Reconcile, Scheduler, SchedulerConfig};
use pgwarden_operator::store::memory::MemoryStore;
use pgwarden_operator::{Error, ReconcileOutcome, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Missing,
    Fail,
    Conflict,
}

/// Records how often each key ran and how many runs overlapped.
struct Recorder {
    behaviour: Mutex<Behaviour>,
    running: Mutex<HashMap<String, usize>>,
    max_overlap: Mutex<usize>,
    calls: Mutex<HashMap<String, usize>>,
    hold: Duration,
}

impl Recorder {
    fn new(behaviour: Behaviour, hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Mutex::new(behaviour),
            running: Mutex::new(HashMap::new()),
            max_overlap: Mutex::new(0),
            calls: Mutex::new(HashMap::new()),
            hold,
        })
    }

    fn calls(&self, key: &str) -> usize {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }

    fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }
}

#[async_trait]
impl Reconcile for Recorder {
    async fn reconcile(&self, key: &str) -> Result<ReconcileOutcome> {
        {
            let mut running = self.running.lock();
            let n = running.entry(key.to_string()).or_insert(0);
            *n += 1;
            let mut max = self.max_overlap.lock();
            *max = (*max).max(*n);
        }
        *self.calls.lock().entry(key.to_string()).or_insert(0) += 1;
        tokio::time::sleep(self.hold).await;
        if let Some(n) = self.running.lock().get_mut(key) {
            *n -= 1;
        }

        match *self.behaviour.lock() {
            Behaviour::Succeed => Ok(ReconcileOutcome {
                phase: ClusterPhase::Healthy,
                requeue_after: None,
            }),
            Behaviour::Missing => Err(Error::not_found("cluster", key)),
            Behaviour::Fail => Err(Error::store("apiserver unavailable")),
            Behaviour::Conflict => Err(Error::conflict("cluster", key)),
        }
    }
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        resync_interval: Duration::from_secs(3600),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn missing_cluster_is_dropped_without_retry() {
    let recorder = Recorder::new(Behaviour::Missing, Duration::ZERO);
    let scheduler = Scheduler::new(recorder.clone(), Arc::new(MemoryStore::new()), config(1));

    scheduler.process("gone").await;
    assert_eq!(scheduler.attempts("gone"), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scheduler.queue().is_empty());
}

#[tokio::test]
async fn failures_back_off_until_success_resets() {
    let recorder = Recorder::new(Behaviour::Fail, Duration::ZERO);
    let scheduler = Scheduler::new(recorder.clone(), Arc::new(MemoryStore::new()), config(1));

    scheduler.process("pg").await;
    scheduler.process("pg").await;
    scheduler.process("pg").await;
    assert_eq!(scheduler.attempts("pg"), 3);

    // Retries land back on the queue once their delay elapses.
    let queue = Arc::clone(scheduler.queue());
    wait_for(|| !queue.is_empty()).await;

    recorder.set(Behaviour::Succeed);
    scheduler.process("pg").await;
    assert_eq!(scheduler.attempts("pg"), 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_conflicts_are_retried_with_growing_delay() {
    let recorder = Recorder::new(Behaviour::Conflict, Duration::ZERO);
    let scheduler = Scheduler::new(recorder.clone(), Arc::new(MemoryStore::new()), config(1));
    let queue = Arc::clone(scheduler.queue());

    // First retry after 10ms, not immediately.
    scheduler.process("pg").await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(9)).await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(queue.len(), 1);
    let key = queue.next().await.unwrap();
    queue.done(&key);

    // Second retry after 20ms.
    scheduler.process("pg").await;
    tokio::time::sleep(Duration::from_millis(19)).await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(scheduler.attempts("pg"), 2);

    recorder.set(Behaviour::Succeed);
    scheduler.process("pg").await;
    assert_eq!(scheduler.attempts("pg"), 0);
}

#[tokio::test]
async fn run_reconciles_listed_clusters_and_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    for name in ["alpha", "beta"] {
        store.insert_cluster(Cluster::new(name, ClusterSpec::default()));
    }
    let recorder = Recorder::new(Behaviour::Succeed, Duration::from_millis(5));
    let scheduler = Scheduler::new(recorder.clone(), store, config(2));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&scheduler).run(rx));

    wait_for(|| recorder.calls("alpha") > 0 && recorder.calls("beta") > 0).await;

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stops")
        .unwrap();
}

#[tokio::test]
async fn one_key_never_runs_twice_at_once() {
    let store = Arc::new(MemoryStore::new());
    let recorder = Recorder::new(Behaviour::Succeed, Duration::from_millis(20));
    let scheduler = Scheduler::new(recorder.clone(), store, config(4));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&scheduler).run(rx));

    for _ in 0..20 {
        scheduler.queue().add("pg");
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    wait_for(|| scheduler.queue().is_empty() && !scheduler.queue().is_in_flight("pg")).await;

    assert!(recorder.calls("pg") >= 2, "adds during a run queue one more run");
    assert!(recorder.calls("pg") < 20, "adds while queued are coalesced");
    assert_eq!(*recorder.max_overlap.lock(), 1);

    tx.send(true).unwrap();
    handle.await.unwrap();
}
