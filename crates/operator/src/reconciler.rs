//! One reconcile cycle for one cluster.
//!
//! Every cycle re-reads the cluster, its volumes and instances, probes the
//! instances, and then runs adoption, the failover orchestrator and topology
//! convergence in that order. Nothing is cached between cycles: the persisted
//! status is the only memory, so any controller replica can pick up where
//! another left off.

use chrono::Utc;
use pgwarden_core::{config, ClusterEvent, ClusterPhase};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::adoption::reconcile_restored_cluster;
use crate::api::metrics;
use crate::error::{Error, Result};
use crate::failover::orchestrate;
use crate::instance::{observe_all, InstanceClient};
use crate::store::ObjectStore;
use crate::topology::converge;

/// Timing knobs of the reconcile cycle.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Bound on each instance health probe.
    pub probe_timeout: Duration,
    /// How long the designated primary may be unready before it is lost.
    pub primary_grace: Duration,
    /// How long a failover may go without an eligible standby, or a
    /// promotion without leaving recovery, before a stall event is raised.
    pub failover_timeout: Duration,
    /// Requeue delay while a transition is in progress.
    pub transition_poll: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(config::DEFAULT_PROBE_TIMEOUT_SECS),
            primary_grace: Duration::from_secs(config::DEFAULT_PRIMARY_GRACE_SECS),
            failover_timeout: Duration::from_secs(config::DEFAULT_FAILOVER_TIMEOUT_SECS),
            transition_poll: Duration::from_secs(config::TRANSITION_POLL_SECS),
        }
    }
}

/// What the scheduler should do after a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub phase: ClusterPhase,
    /// Requeue sooner than the periodic resync.
    pub requeue_after: Option<Duration>,
}

fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Reconciles clusters against an object store and their instances.
#[derive(Clone)]
pub struct ClusterReconciler {
    store: Arc<dyn ObjectStore>,
    instances: Arc<dyn InstanceClient>,
    config: ReconcilerConfig,
}

impl ClusterReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        instances: Arc<dyn InstanceClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            instances,
            config,
        }
    }

    /// Runs one cycle for `name`, re-reading and recomputing on write
    /// conflicts up to [`config::MAX_CONFLICT_RETRIES`] times.
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let span = tracing::info_span!("reconcile", cluster = %name);
        async {
            let start = Instant::now();
            let mut attempt = 0;
            let result = loop {
                match self.reconcile_once(name).await {
                    Err(e) if e.is_conflict() && attempt < config::MAX_CONFLICT_RETRIES => {
                        attempt += 1;
                        tracing::debug!(attempt, error = %e, "Write conflict, re-reading");
                    }
                    other => break other,
                }
            };
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            metrics::record_reconcile(name, outcome, start.elapsed());
            if let Err(e) = &result {
                self.report_failure(name, e).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn reconcile_once(&self, name: &str) -> Result<ReconcileOutcome> {
        let store = self.store.as_ref();
        let client = self.instances.as_ref();

        let cluster = store
            .get_cluster(name)
            .await?
            .ok_or_else(|| Error::not_found("cluster", name))?;

        // With the status recorded, a failed resume is logged and the cycle
        // goes on. The resume path never writes the cluster, so `cluster` is
        // still current.
        let recorded = cluster.status.latest_generated_node != 0;
        let cluster = match reconcile_restored_cluster(store, cluster.clone()).await {
            Ok((cluster, report)) => {
                if !report.adopted.is_empty() {
                    tracing::info!(
                        adopted = report.adopted.len(),
                        primary = %cluster.status.target_primary,
                        "Restored cluster from orphan PVCs"
                    );
                }
                cluster
            }
            Err(e) if recorded && !e.is_conflict() && !e.is_not_found() => {
                tracing::warn!(error = %e, "Adoption of orphan PVCs failed, continuing");
                cluster
            }
            Err(e) => return Err(e),
        };

        let instances = store.list_instances(name).await?;
        let observed = observe_all(client, instances, self.config.probe_timeout).await;

        let failover = orchestrate(store, client, &self.config, cluster, &observed, Utc::now()).await?;
        if failover.halt {
            return Ok(ReconcileOutcome {
                phase: failover.cluster.status.phase,
                requeue_after: failover.requeue_after,
            });
        }

        let topology = converge(store, client, &self.config, failover.cluster, observed).await?;
        Ok(ReconcileOutcome {
            phase: topology.cluster.status.phase,
            requeue_after: earliest(failover.requeue_after, topology.requeue_after),
        })
    }

    /// Surfaces errors that need an operator's attention on the cluster.
    async fn report_failure(&self, name: &str, error: &Error) {
        match error {
            Error::MalformedIdentity(_) | Error::Store { .. } | Error::Instance { .. } => {
                tracing::error!(error = %error, "Reconcile failed");
            }
            _ => {
                tracing::debug!(error = %error, "Reconcile did not complete");
                return;
            }
        }
        let cluster = match self.store.get_cluster(name).await {
            Ok(Some(cluster)) => cluster,
            _ => return,
        };
        let event = ClusterEvent::warning("ReconcileError", error.to_string());
        if let Err(e) = self.store.record_event(&cluster, event).await {
            tracing::warn!(error = %e, "Failed to record event");
        }
    }
}
