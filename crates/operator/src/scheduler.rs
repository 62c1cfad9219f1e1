//! Reconcile scheduling: a deduplicating work queue drained by a fixed pool
//! of tokio workers.
//!
//! Keys are cluster names. A key is queued at most once, and at most one
//! worker holds it at a time; a key added while it is being reconciled is
//! marked dirty and queued again as soon as the running cycle finishes.
//! Failed cycles, conflicts included, are retried with per-key exponential
//! backoff, except for `NotFound`, which drops the key until the next watch
//! event names it.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use pgwarden_core::backoff::Backoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

use crate::api::metrics;
use crate::error::Result;
use crate::reconciler::{ClusterReconciler, ReconcileOutcome};
use crate::store::ObjectStore;

/// Something the scheduler can run for a key.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &str) -> Result<ReconcileOutcome>;
}

#[async_trait]
impl Reconcile for ClusterReconciler {
    async fn reconcile(&self, key: &str) -> Result<ReconcileOutcome> {
        ClusterReconciler::reconcile(self, key).await
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    shutdown: bool,
}

/// Deduplicating FIFO of keys.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `key` unless it is already waiting. A key currently being
    /// processed is marked dirty instead.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutdown || state.queued.contains(key) {
            return;
        }
        if state.in_flight.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        state.queued.insert(key.to_string());
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Queues `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    fn try_take(&self) -> Option<String> {
        let mut state = self.state.lock();
        let key = state.queue.pop_front()?;
        state.queued.remove(&key);
        state.in_flight.insert(key.clone());
        Some(key)
    }

    /// Waits for the next key and marks it in flight. `None` after shutdown.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().shutdown {
                return None;
            }
            if let Some(key) = self.try_take() {
                return Some(key);
            }
            notified.await;
        }
    }

    /// Releases `key`, re-queueing it if it was added while in flight.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.state.lock().in_flight.contains(key)
    }

    /// Stops handing out keys; waiting workers return `None`.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Period of the level-triggered full resync.
    pub resync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        use pgwarden_core::config;
        Self {
            workers: config::DEFAULT_WORKERS,
            resync_interval: Duration::from_secs(config::DEFAULT_RESYNC_INTERVAL_SECS),
            backoff_base: Duration::from_millis(config::BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(config::BACKOFF_MAX_MS),
        }
    }
}

/// Feeds the work queue and runs the worker pool.
pub struct Scheduler {
    reconciler: Arc<dyn Reconcile>,
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue>,
    config: SchedulerConfig,
    backoffs: Mutex<HashMap<String, Backoff>>,
}

impl Scheduler {
    pub fn new(
        reconciler: Arc<dyn Reconcile>,
        store: Arc<dyn ObjectStore>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            store,
            queue: WorkQueue::new(),
            config,
            backoffs: Mutex::new(HashMap::new()),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Runs one cycle for `key` and schedules its follow-up.
    pub async fn process(&self, key: &str) {
        match self.reconciler.reconcile(key).await {
            Ok(outcome) => {
                self.backoffs.lock().remove(key);
                if let Some(delay) = outcome.requeue_after {
                    self.queue.add_after(key, delay);
                }
            }
            Err(e) if e.is_not_found() => {
                self.backoffs.lock().remove(key);
                tracing::info!(cluster = %key, "Cluster no longer exists, dropping");
            }
            Err(e) => {
                let delay = self.next_retry_delay(key);
                if e.is_conflict() {
                    tracing::debug!(
                        cluster = %key,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Conflict persisted, requeueing"
                    );
                } else {
                    tracing::warn!(
                        cluster = %key,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Reconcile failed, retrying"
                    );
                }
                self.queue.add_after(key, delay);
            }
        }
        metrics::update_queue_depth(self.queue.len());
    }

    fn next_retry_delay(&self, key: &str) -> Duration {
        self.backoffs
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Backoff::new(self.config.backoff_base, self.config.backoff_max))
            .next_delay()
    }

    /// Current retry attempt count for `key`.
    pub fn attempts(&self, key: &str) -> u32 {
        self.backoffs
            .lock()
            .get(key)
            .map(Backoff::attempts)
            .unwrap_or(0)
    }

    async fn resync(&self) {
        match self.store.list_clusters().await {
            Ok(clusters) => {
                for cluster in clusters {
                    self.queue.add(cluster.name());
                }
            }
            Err(e) => tracing::warn!(error = %e, "Resync listing failed"),
        }
    }

    /// Runs until `shutdown` flips to `true`, then lets in-flight cycles finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let feeder = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let mut changes = this.store.watch();
                while let Some(key) = changes.next().await {
                    this.queue.add(&key);
                }
                tracing::warn!("Watch stream ended");
            })
        };

        let ticker = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.resync_interval);
                loop {
                    interval.tick().await;
                    this.resync().await;
                }
            })
        };

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| {
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    while let Some(key) = this.queue.next().await {
                        this.process(&key).await;
                        this.queue.done(&key);
                    }
                    tracing::debug!(worker = id, "Worker stopped");
                })
            })
            .collect();
        tracing::info!(workers = workers.len(), "Scheduler started");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        tracing::info!("Scheduler shutting down");
        feeder.abort();
        ticker.abort();
        self.queue.shutdown();
        for worker in workers {
            let _ = worker.await;
        }
    }
}
