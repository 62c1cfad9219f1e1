//! Primary-failure orchestration.
//!
//! Drives the persisted phase through
//! `Healthy → PrimaryLost → Electing → Promoting → Healthy`. Each step is a
//! compare-and-swap on the cluster status, so a controller that crashes at
//! any point resumes from the last committed phase. The write of
//! `targetPrimary` together with `Promoting` is the single point at which a
//! successor becomes authoritative; promotion is only requested afterwards.

use chrono::{DateTime, Utc};
use pgwarden_core::election::{elect, Candidate};
use pgwarden_core::failover::{assess_primary, failover_stalled, PrimaryAssessment};
use pgwarden_core::{Cluster, ClusterEvent, ClusterPhase, ClusterStatus};
use std::time::Duration;

use crate::api::metrics;
use crate::error::Result;
use crate::instance::{InstanceClient, Observed};
use crate::reconciler::ReconcilerConfig;
use crate::store::ObjectStore;

const STALLED_REASON_PREFIX: &str = "failover stalled";
const PROMOTION_STALLED_REASON_PREFIX: &str = "promotion stalled";

/// What the rest of the cycle should do after the orchestrator ran.
#[derive(Debug)]
pub struct FailoverOutcome {
    /// Cluster as last written.
    pub cluster: Cluster,
    /// `true` while a failover step is pending; topology changes wait.
    pub halt: bool,
    pub requeue_after: Option<Duration>,
}

impl FailoverOutcome {
    fn proceed(cluster: Cluster) -> Self {
        Self {
            cluster,
            halt: false,
            requeue_after: None,
        }
    }

    fn wait(cluster: Cluster, after: Duration) -> Self {
        Self {
            cluster,
            halt: true,
            requeue_after: Some(after),
        }
    }
}

/// Status with the phase moved to `next`. Illegal transitions are a bug in
/// the caller and are logged, never silently written.
fn transition(status: &ClusterStatus, next: ClusterPhase, reason: impl Into<String>) -> ClusterStatus {
    if !status.phase.can_transition_to(next) {
        tracing::error!(from = %status.phase, to = %next, "Illegal phase transition");
    }
    let mut status = status.clone();
    status.phase = next;
    status.phase_reason = reason.into();
    status
}

/// Standbys eligible for promotion: healthy, in recovery, and not the
/// designated (failed) primary.
pub fn candidates(target: &str, observed: &[Observed]) -> Vec<Candidate> {
    observed
        .iter()
        .filter(|o| o.instance.name != target && o.is_streaming_standby())
        .filter_map(|o| {
            o.status.map(|s| Candidate {
                name: o.instance.name.clone(),
                serial: o.instance.serial,
                position: s.position(),
            })
        })
        .collect()
}

/// Runs one failover step for `cluster` given this cycle's observations.
pub async fn orchestrate(
    store: &dyn ObjectStore,
    client: &dyn InstanceClient,
    config: &ReconcilerConfig,
    cluster: Cluster,
    observed: &[Observed],
    now: DateTime<Utc>,
) -> Result<FailoverOutcome> {
    let target = cluster.status.target_primary.clone();
    if target.is_empty() {
        return Ok(FailoverOutcome::proceed(cluster));
    }
    let target_obs = observed.iter().find(|o| o.instance.name == target);
    let target_serving = target_obs.map(Observed::is_serving_primary).unwrap_or(false);

    match cluster.status.phase {
        // Nothing has been verified yet; there is no primary to lose.
        ClusterPhase::Bootstrapping => Ok(FailoverOutcome::proceed(cluster)),
        ClusterPhase::Healthy | ClusterPhase::Rejoining => {
            watch_primary(store, client, config, cluster, observed, target_serving, now).await
        }
        ClusterPhase::PrimaryLost | ClusterPhase::Electing => {
            if target_serving {
                return recovered(store, cluster).await;
            }
            elect_successor(store, client, config, cluster, observed, now).await
        }
        ClusterPhase::Promoting => {
            finish_promotion(store, client, config, cluster, target_obs, now).await
        }
    }
}

async fn watch_primary(
    store: &dyn ObjectStore,
    client: &dyn InstanceClient,
    config: &ReconcilerConfig,
    cluster: Cluster,
    observed: &[Observed],
    target_serving: bool,
    now: DateTime<Utc>,
) -> Result<FailoverOutcome> {
    let failing_since = cluster.status.current_primary_failing_since;
    match assess_primary(target_serving, failing_since, now, config.primary_grace) {
        PrimaryAssessment::Healthy => {
            if failing_since.is_none() {
                return Ok(FailoverOutcome::proceed(cluster));
            }
            tracing::info!(primary = %cluster.status.target_primary, "Primary is ready again");
            let mut status = cluster.status.clone();
            status.current_primary_failing_since = None;
            let cluster = store.patch_cluster_status(&cluster, status).await?;
            Ok(FailoverOutcome::proceed(cluster))
        }
        PrimaryAssessment::Suspect { since, remaining } => {
            let cluster = if failing_since.is_none() {
                tracing::warn!(
                    primary = %cluster.status.target_primary,
                    grace_ms = config.primary_grace.as_millis() as u64,
                    "Primary is not ready, waiting for the grace period"
                );
                let mut status = cluster.status.clone();
                status.current_primary_failing_since = Some(since);
                store.patch_cluster_status(&cluster, status).await?
            } else {
                cluster
            };
            Ok(FailoverOutcome::wait(cluster, remaining.max(config.transition_poll)))
        }
        PrimaryAssessment::Lost { since } => {
            let primary = cluster.status.target_primary.clone();
            tracing::warn!(primary = %primary, "Primary lost, starting failover");
            let mut status = transition(
                &cluster.status,
                ClusterPhase::PrimaryLost,
                format!("primary {primary} lost, electing"),
            );
            status.current_primary_failing_since = Some(since);
            let cluster = store.patch_cluster_status(&cluster, status).await?;
            store
                .record_event(
                    &cluster,
                    ClusterEvent::warning(
                        "PrimaryLost",
                        format!("primary {primary} not ready since {}", since.to_rfc3339()),
                    ),
                )
                .await?;
            elect_successor(store, client, config, cluster, observed, now).await
        }
    }
}

/// The designated primary came back before a successor was committed.
async fn recovered(store: &dyn ObjectStore, cluster: Cluster) -> Result<FailoverOutcome> {
    let primary = cluster.status.target_primary.clone();
    tracing::info!(primary = %primary, "Primary recovered before failover was committed");
    let mut status = transition(
        &cluster.status,
        ClusterPhase::Healthy,
        format!("primary {primary} recovered"),
    );
    status.current_primary_failing_since = None;
    status.promotion_started = None;
    let cluster = store.patch_cluster_status(&cluster, status).await?;
    store
        .record_event(
            &cluster,
            ClusterEvent::normal("PrimaryRecovered", format!("primary {primary} is ready again")),
        )
        .await?;
    Ok(FailoverOutcome::proceed(cluster))
}

async fn elect_successor(
    store: &dyn ObjectStore,
    client: &dyn InstanceClient,
    config: &ReconcilerConfig,
    mut cluster: Cluster,
    observed: &[Observed],
    now: DateTime<Utc>,
) -> Result<FailoverOutcome> {
    let failed = cluster.status.target_primary.clone();
    let candidates = candidates(&failed, observed);

    let Some(winner) = elect(&candidates).cloned() else {
        return stall(store, config, cluster, &failed, now).await;
    };

    if cluster.status.phase == ClusterPhase::PrimaryLost {
        let status = transition(
            &cluster.status,
            ClusterPhase::Electing,
            format!("electing a successor for {failed}"),
        );
        cluster = store.patch_cluster_status(&cluster, status).await?;
    }

    tracing::info!(
        failed = %failed,
        elected = %winner.name,
        position = %winner.position,
        candidates = candidates.len(),
        "Elected new primary"
    );
    let mut status = transition(
        &cluster.status,
        ClusterPhase::Promoting,
        format!("promoting {} to replace {failed}", winner.name),
    );
    status.target_primary = winner.name.clone();
    status.current_primary_failing_since = None;
    status.promotion_started = Some(now);
    let cluster = store.patch_cluster_status(&cluster, status).await?;

    metrics::record_failover(cluster.name());
    store
        .record_event(
            &cluster,
            ClusterEvent::normal(
                "FailoverStarted",
                format!("promoting {} at {} to replace {failed}", winner.name, winner.position),
            ),
        )
        .await?;

    if let Some(elected) = observed.iter().find(|o| o.instance.name == winner.name) {
        if let Err(e) = client.promote(&elected.instance).await {
            // The committed target stands; the next cycle asks again.
            tracing::warn!(instance = %winner.name, error = %e, "Promotion request failed");
        }
    }
    Ok(FailoverOutcome::wait(cluster, config.transition_poll))
}

async fn stall(
    store: &dyn ObjectStore,
    config: &ReconcilerConfig,
    cluster: Cluster,
    failed: &str,
    now: DateTime<Utc>,
) -> Result<FailoverOutcome> {
    let since = cluster.status.current_primary_failing_since.unwrap_or(now);
    let stalled = failover_stalled(since, now, config.failover_timeout);
    let already_reported = cluster.status.phase_reason.starts_with(STALLED_REASON_PREFIX);

    let reason = if stalled {
        format!("{STALLED_REASON_PREFIX}: no standby eligible to replace {failed}")
    } else {
        format!("primary {failed} lost, no standby eligible yet")
    };
    let needs_write = cluster.status.phase != ClusterPhase::PrimaryLost
        || cluster.status.current_primary_failing_since.is_none()
        || (stalled && !already_reported);

    let cluster = if needs_write {
        tracing::warn!(failed = %failed, "No standby eligible for promotion");
        let mut status = transition(&cluster.status, ClusterPhase::PrimaryLost, reason);
        status.current_primary_failing_since = Some(since);
        store.patch_cluster_status(&cluster, status).await?
    } else {
        cluster
    };

    if stalled && !already_reported {
        tracing::error!(
            failed = %failed,
            timeout_secs = config.failover_timeout.as_secs(),
            "Failover stalled"
        );
        store
            .record_event(
                &cluster,
                ClusterEvent::warning(
                    "FailoverStalled",
                    format!(
                        "no standby eligible to replace {failed} after {}s",
                        config.failover_timeout.as_secs()
                    ),
                ),
            )
            .await?;
    }
    Ok(FailoverOutcome::wait(cluster, config.transition_poll))
}

async fn finish_promotion(
    store: &dyn ObjectStore,
    client: &dyn InstanceClient,
    config: &ReconcilerConfig,
    cluster: Cluster,
    elected: Option<&Observed>,
    now: DateTime<Utc>,
) -> Result<FailoverOutcome> {
    let target = cluster.status.target_primary.clone();

    if let Some(obs) = elected.filter(|o| o.is_serving_primary()) {
        tracing::info!(primary = %target, "Promotion complete");
        let mut status = transition(
            &cluster.status,
            ClusterPhase::Healthy,
            format!("{target} promoted"),
        );
        status.current_primary = target.clone();
        status.current_primary_failing_since = None;
        status.promotion_started = None;
        let cluster = store.patch_cluster_status(&cluster, status).await?;
        store
            .record_event(
                &cluster,
                ClusterEvent::normal(
                    "FailoverCompleted",
                    format!("{} is the new primary", obs.instance.name),
                ),
            )
            .await?;
        return Ok(FailoverOutcome::proceed(cluster));
    }

    if let Some(obs) = elected.filter(|o| o.is_healthy()) {
        // Still in recovery: the promote request was lost or is in progress.
        if let Err(e) = client.promote(&obs.instance).await {
            tracing::warn!(instance = %target, error = %e, "Promotion request failed");
        }
        return promotion_pending(store, config, cluster, &target, now).await;
    }

    // The elected instance itself stopped answering; debounce like any primary.
    let failing_since = cluster.status.current_primary_failing_since;
    match assess_primary(false, failing_since, now, config.primary_grace) {
        PrimaryAssessment::Lost { since } => {
            tracing::warn!(elected = %target, "Elected primary lost during promotion");
            let mut status = transition(
                &cluster.status,
                ClusterPhase::PrimaryLost,
                format!("elected primary {target} lost during promotion"),
            );
            status.current_primary_failing_since = Some(since);
            status.promotion_started = None;
            let cluster = store.patch_cluster_status(&cluster, status).await?;
            Ok(FailoverOutcome::wait(cluster, config.transition_poll))
        }
        PrimaryAssessment::Suspect { since, remaining } => {
            let cluster = if failing_since.is_none() {
                let mut status = cluster.status.clone();
                status.current_primary_failing_since = Some(since);
                store.patch_cluster_status(&cluster, status).await?
            } else {
                cluster
            };
            Ok(FailoverOutcome::wait(cluster, remaining.max(config.transition_poll)))
        }
        PrimaryAssessment::Healthy => Ok(FailoverOutcome::wait(cluster, config.transition_poll)),
    }
}

/// The elected instance is healthy but has not left recovery yet. Past the
/// failover timeout a single `PromotionStalled` warning is raised; the
/// promote request keeps being re-sent either way.
async fn promotion_pending(
    store: &dyn ObjectStore,
    config: &ReconcilerConfig,
    cluster: Cluster,
    target: &str,
    now: DateTime<Utc>,
) -> Result<FailoverOutcome> {
    let started = cluster.status.promotion_started.unwrap_or(now);
    let stalled = failover_stalled(started, now, config.failover_timeout);
    let already_reported = cluster
        .status
        .phase_reason
        .starts_with(PROMOTION_STALLED_REASON_PREFIX);
    let report = stalled && !already_reported;

    let needs_write = report
        || cluster.status.promotion_started.is_none()
        || cluster.status.current_primary_failing_since.is_some();
    let cluster = if needs_write {
        let mut status = cluster.status.clone();
        status.current_primary_failing_since = None;
        status.promotion_started = Some(started);
        if report {
            status.phase_reason =
                format!("{PROMOTION_STALLED_REASON_PREFIX}: {target} is still in recovery");
        }
        store.patch_cluster_status(&cluster, status).await?
    } else {
        cluster
    };

    if report {
        tracing::error!(
            elected = %target,
            timeout_secs = config.failover_timeout.as_secs(),
            "Promotion stalled"
        );
        store
            .record_event(
                &cluster,
                ClusterEvent::warning(
                    "PromotionStalled",
                    format!(
                        "{target} still in recovery {}s after promotion was requested",
                        config.failover_timeout.as_secs()
                    ),
                ),
            )
            .await?;
    }
    Ok(FailoverOutcome::wait(cluster, config.transition_poll))
}
