//! Rebuilding cluster bookkeeping from durable volume metadata.
//!
//! A cluster whose status was never recorded (restored from a backup of its
//! manifests, or recreated after the object was deleted with its volumes
//! retained) has `latestGeneratedNode == 0`. If orphaned volumes carrying the
//! cluster label exist, their serial annotations and role labels are the only
//! source of truth: the highest serial becomes `latestGeneratedNode`, the
//! volume labelled primary becomes `targetPrimary`, and every orphan is taken
//! back under the cluster's ownership.
//!
//! The status is written before any volume. A pass that fails half-way leaves
//! the remaining volumes orphaned with serials at or below
//! `latestGeneratedNode`; the next cycle finds them again and finishes the job.

use pgwarden_core::serial::{parse_serial, reduce_serials};
use pgwarden_core::{config, Cluster, ClusterEvent, ObjectMeta, StorageArtifact};

use crate::api::metrics;
use crate::error::Result;
use crate::orphan::find_orphans;
use crate::store::ObjectStore;

/// Outcome of one adoption pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdoptionReport {
    /// Names of the volumes whose ownership was set during this pass.
    pub adopted: Vec<String>,
    /// Highest serial found; 0 when the status was left untouched.
    pub highest_serial: u32,
    /// Instance designated primary; empty when the status was left untouched.
    pub primary: String,
}

impl AdoptionReport {
    pub fn is_noop(&self) -> bool {
        self.adopted.is_empty() && self.highest_serial == 0
    }
}

/// Metadata an orphan carries once it belongs to `cluster` again.
pub fn adopted_meta(cluster: &Cluster, artifact: &StorageArtifact) -> ObjectMeta {
    let mut meta = artifact.meta.clone();
    let owner = cluster.owner_reference();
    meta.owner_references.retain(|r| r.kind != owner.kind);
    meta.owner_references.push(owner);
    meta.labels
        .insert(config::CLUSTER_LABEL.to_string(), cluster.name().to_string());
    meta.annotations.insert(
        config::OPERATOR_VERSION_ANNOTATION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    meta.annotations.insert(
        config::PVC_STATUS_ANNOTATION.to_string(),
        config::PVC_STATUS_READY.to_string(),
    );
    meta.annotations
        .remove(config::HIBERNATE_MANIFEST_ANNOTATION);
    meta.annotations
        .remove(config::HIBERNATE_PG_CONTROL_DATA_ANNOTATION);
    meta
}

/// Re-adopts orphaned volumes of `cluster`, restoring its status first when
/// it was never recorded.
///
/// Returns the cluster as last written, so callers keep a fresh
/// `resource_version` for their own compare-and-swap writes.
pub async fn reconcile_restored_cluster(
    store: &dyn ObjectStore,
    cluster: Cluster,
) -> Result<(Cluster, AdoptionReport)> {
    let mut report = AdoptionReport::default();
    let orphans = find_orphans(store, cluster.name()).await?;
    if orphans.is_empty() {
        if cluster.status.latest_generated_node == 0 {
            tracing::info!("no orphan PVCs found, skipping the restored cluster reconciliation");
        }
        return Ok((cluster, report));
    }

    let (cluster, orphans) = if cluster.status.latest_generated_node == 0 {
        // Fail fast: one malformed serial and nothing is touched.
        let summary = reduce_serials(orphans.iter().map(|a| &a.meta))?;
        tracing::info!(
            pvcs = ?orphans.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "found orphan pvcs, trying to restore the cluster"
        );
        if summary.primary == 0 {
            tracing::info!("no primary serial found, assigning the highest serial as the primary");
        }
        let primary = cluster.instance_name(summary.primary_or_highest());
        let mut status = cluster.status.clone();
        status.latest_generated_node = summary.highest;
        status.target_primary = primary.clone();
        let cluster = store.patch_cluster_status(&cluster, status).await?;
        tracing::debug!(
            latest_generated_node = summary.highest,
            target_primary = %primary,
            "restored the cluster status, proceeding to restore the orphan PVCs"
        );
        report.highest_serial = summary.highest;
        report.primary = primary;
        (cluster, orphans)
    } else {
        // Leftovers of an interrupted pass. Each volume is judged on its own:
        // the status is already recorded, so a bad one is skipped, not fatal.
        // Anything newer than the recorded serial was not part of that pass
        // and would break monotonicity.
        let latest = cluster.status.latest_generated_node;
        let mut resumable = Vec::with_capacity(orphans.len());
        for artifact in orphans {
            match parse_serial(&artifact.meta) {
                Ok(serial) if serial <= latest => resumable.push(artifact),
                Ok(serial) => tracing::warn!(
                    pvc = artifact.name(),
                    serial,
                    latest_generated_node = latest,
                    "Orphan PVC serial is beyond the recorded serial, not adopting"
                ),
                Err(e) => tracing::warn!(
                    pvc = artifact.name(),
                    error = %e,
                    "Skipping orphan PVC with unreadable serial"
                ),
            }
        }
        if resumable.is_empty() {
            return Ok((cluster, report));
        }
        tracing::info!(count = resumable.len(), "Resuming adoption of orphan PVCs");
        (cluster, resumable)
    };

    for artifact in &orphans {
        let meta = adopted_meta(&cluster, artifact);
        store.patch_artifact_meta(artifact, meta).await?;
        tracing::info!(pvc = artifact.name(), "Adopted orphan PVC");
        report.adopted.push(artifact.name().to_string());
    }

    metrics::record_adoption(cluster.name(), report.adopted.len());
    store
        .record_event(
            &cluster,
            ClusterEvent::normal(
                "ClusterRestored",
                format!("adopted {} orphan PVC(s)", report.adopted.len()),
            ),
        )
        .await?;
    Ok((cluster, report))
}
