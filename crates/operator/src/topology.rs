//! Convergence of the instance set towards the declared shape.
//!
//! Runs after the failover orchestrator on every cycle that is not waiting
//! for a failover step:
//!
//! 1. Allocate serial 1 for a cluster that has never had an instance.
//! 2. Delete instances whose volume is gone. Their serial is never reused.
//! 3. Recreate instances for owned volumes that have none (restore path).
//! 4. Demote any instance other than the designated primary that still
//!    serves writes, and align role labels on instances and volumes.
//! 5. Provision new standbys at fresh serials until `spec.instances` exist.
//! 6. Settle the phase on `Healthy` or `Rejoining`.

use pgwarden_core::serial::parse_serial;
use pgwarden_core::{
    config, Cluster, ClusterEvent, ClusterPhase, Instance, InstanceRole, StorageArtifact,
};
use std::collections::HashMap;
use std::time::Duration;

use crate::api::metrics;
use crate::error::Result;
use crate::instance::{InstanceClient, Observed};
use crate::reconciler::ReconcilerConfig;
use crate::store::ObjectStore;

/// Result of one convergence pass.
#[derive(Debug)]
pub struct TopologyOutcome {
    pub cluster: Cluster,
    pub requeue_after: Option<Duration>,
}

/// Role an instance should carry given the designated primary.
fn desired_role(cluster: &Cluster, name: &str) -> InstanceRole {
    if cluster.status.target_primary == name {
        InstanceRole::Primary
    } else {
        InstanceRole::Standby
    }
}

/// `true` when every declared instance exists and the standbys stream from
/// a serving primary.
pub fn is_converged(cluster: &Cluster, observed: &[Observed]) -> bool {
    let target = &cluster.status.target_primary;
    observed.len() as u32 >= cluster.spec.instances
        && observed.iter().all(|o| {
            if &o.instance.name == target {
                o.is_serving_primary()
            } else {
                o.is_streaming_standby()
            }
        })
}

/// Allocates the next serial by bumping `latestGeneratedNode`. The write is
/// committed before anything is created under the new name.
async fn allocate_serial(store: &dyn ObjectStore, cluster: &Cluster) -> Result<(Cluster, u32)> {
    let serial = cluster.status.latest_generated_node + 1;
    let mut status = cluster.status.clone();
    status.latest_generated_node = serial;
    if status.target_primary.is_empty() {
        status.target_primary = cluster.instance_name(serial);
    }
    let cluster = store.patch_cluster_status(cluster, status).await?;
    Ok((cluster, serial))
}

async fn create_member(
    store: &dyn ObjectStore,
    cluster: &Cluster,
    serial: u32,
    artifact_exists: bool,
) -> Result<Instance> {
    let role = desired_role(cluster, &cluster.instance_name(serial));
    if !artifact_exists {
        store
            .create_artifact(&StorageArtifact::for_instance(cluster, serial, role))
            .await?;
    }
    let instance = store
        .create_instance(cluster, &Instance::for_cluster(cluster, serial, role))
        .await?;
    tracing::info!(instance = %instance.name, role = %role, "Created instance");
    Ok(instance)
}

/// Runs one convergence pass.
pub async fn converge(
    store: &dyn ObjectStore,
    client: &dyn InstanceClient,
    config: &ReconcilerConfig,
    mut cluster: Cluster,
    mut observed: Vec<Observed>,
) -> Result<TopologyOutcome> {
    if cluster.status.latest_generated_node == 0 {
        let (updated, serial) = allocate_serial(store, &cluster).await?;
        tracing::info!(serial, "Bootstrapping first instance");
        cluster = updated;
    }

    let artifacts: HashMap<String, StorageArtifact> = store
        .list_artifacts(cluster.name())
        .await?
        .into_iter()
        .filter(|a| a.meta.is_owned_by(&cluster.owner_reference()))
        .map(|a| (a.name().to_string(), a))
        .collect();

    // Instances whose volume was removed cannot come back; drop them.
    let mut kept = Vec::with_capacity(observed.len());
    for obs in observed.drain(..) {
        if artifacts.contains_key(&obs.instance.artifact) {
            kept.push(obs);
            continue;
        }
        tracing::warn!(
            instance = %obs.instance.name,
            pvc = %obs.instance.artifact,
            "Deleting instance whose PVC is gone"
        );
        match store.delete_instance(&obs.instance).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        store
            .record_event(
                &cluster,
                ClusterEvent::warning(
                    "InstanceDeleted",
                    format!("{} deleted, its PVC no longer exists", obs.instance.name),
                ),
            )
            .await?;
    }
    let observed = kept;

    let target = cluster.status.target_primary.clone();
    let primary_verified = observed
        .iter()
        .any(|o| o.instance.name == target && o.is_serving_primary());

    // Volumes that survived without an instance (restored cluster, evicted
    // pod) get their instance back under the same serial. Standbys need a
    // serving primary to stream from.
    let mut created = 0u32;
    for artifact in artifacts.values() {
        if observed.iter().any(|o| o.instance.artifact == artifact.name()) {
            continue;
        }
        let serial = match parse_serial(&artifact.meta) {
            Ok(serial) => serial,
            Err(e) => {
                tracing::warn!(pvc = artifact.name(), error = %e, "Skipping PVC");
                continue;
            }
        };
        let is_target = artifact.name() == target;
        if !is_target && !primary_verified {
            continue;
        }
        create_member(store, &cluster, serial, true).await?;
        created += 1;
    }

    // A former primary must follow the new one before anything else joins.
    if primary_verified {
        for obs in &observed {
            if obs.instance.name != target && obs.claims_primary() {
                tracing::warn!(
                    instance = %obs.instance.name,
                    primary = %target,
                    "Demoting former primary"
                );
                client.demote(&obs.instance, &target).await?;
                store
                    .record_event(
                        &cluster,
                        ClusterEvent::normal(
                            "InstanceDemoted",
                            format!("{} now follows {target}", obs.instance.name),
                        ),
                    )
                    .await?;
            }
        }
        sync_roles(store, &cluster, &observed, &artifacts).await?;
    }

    // Replacements clone from the primary, so only add them once it serves.
    let existing = observed.len() as u32 + created;
    // Until a primary has been verified there is no data to lose, so the
    // designated serial may be (re)created from scratch.
    let bootstrapping = cluster.status.phase == ClusterPhase::Bootstrapping
        && observed.is_empty()
        && created == 0
        && !artifacts.contains_key(&target);
    if bootstrapping {
        let serial = parse_target_serial(&cluster)?;
        create_member(store, &cluster, serial, false).await?;
        metrics::record_instance_provisioned(cluster.name());
        created += 1;
    } else if primary_verified {
        for _ in existing..cluster.spec.instances {
            let (updated, serial) = allocate_serial(store, &cluster).await?;
            cluster = updated;
            create_member(store, &cluster, serial, false).await?;
            metrics::record_instance_provisioned(cluster.name());
            store
                .record_event(
                    &cluster,
                    ClusterEvent::normal(
                        "InstanceCreated",
                        format!("created {} as a standby of {target}", cluster.instance_name(serial)),
                    ),
                )
                .await?;
            created += 1;
        }
    }

    let converged = created == 0 && is_converged(&cluster, &observed);
    let cluster = settle_phase(store, cluster, primary_verified, converged).await?;
    metrics::update_cluster_phase(cluster.name(), cluster.status.phase);

    Ok(TopologyOutcome {
        requeue_after: (!converged).then_some(config.transition_poll),
        cluster,
    })
}

fn parse_target_serial(cluster: &Cluster) -> Result<u32> {
    let target = &cluster.status.target_primary;
    let serial = target
        .strip_prefix(cluster.name())
        .and_then(|s| s.strip_prefix('-'))
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|s| *s > 0)
        .ok_or_else(|| pgwarden_core::SerialError::Malformed {
            name: cluster.name().to_string(),
            value: target.clone(),
        })?;
    Ok(serial)
}

/// Aligns role labels on instances and their volumes with the designated
/// primary, so a later adoption pass reads the right roles.
async fn sync_roles(
    store: &dyn ObjectStore,
    cluster: &Cluster,
    observed: &[Observed],
    artifacts: &HashMap<String, StorageArtifact>,
) -> Result<()> {
    for obs in observed {
        let role = desired_role(cluster, &obs.instance.name);
        if obs.instance.role != role {
            store.patch_instance_role(&obs.instance, role).await?;
            tracing::info!(instance = %obs.instance.name, role = %role, "Updated instance role");
        }
        if let Some(artifact) = artifacts.get(&obs.instance.artifact) {
            if artifact.role() != Some(role) {
                let mut meta = artifact.meta.clone();
                meta.labels
                    .insert(config::ROLE_LABEL.to_string(), role.as_label().to_string());
                store.patch_artifact_meta(artifact, meta).await?;
            }
        }
    }
    Ok(())
}

async fn settle_phase(
    store: &dyn ObjectStore,
    cluster: Cluster,
    primary_verified: bool,
    converged: bool,
) -> Result<Cluster> {
    if cluster.status.phase.is_failover_in_progress() || !primary_verified {
        return Ok(cluster);
    }
    let (phase, reason) = if converged {
        (ClusterPhase::Healthy, "cluster is healthy".to_string())
    } else {
        (
            ClusterPhase::Rejoining,
            "waiting for standbys to stream from the primary".to_string(),
        )
    };
    let target = cluster.status.target_primary.clone();
    if cluster.status.phase == phase
        && cluster.status.current_primary == target
        && cluster.status.phase_reason == reason
    {
        return Ok(cluster);
    }
    if !cluster.status.phase.can_transition_to(phase) {
        tracing::error!(from = %cluster.status.phase, to = %phase, "Illegal phase transition");
        return Ok(cluster);
    }
    tracing::info!(phase = %phase, primary = %target, "Cluster phase changed");
    let mut status = cluster.status.clone();
    status.phase = phase;
    status.phase_reason = reason;
    status.current_primary = target;
    store.patch_cluster_status(&cluster, status).await
}
