//! Discovery of storage artifacts left behind without an owner.
//!
//! After a restore the volumes come back carrying the cluster label and their
//! serial annotation but no owner reference. Those are the only artifacts the
//! adoption pass may touch.

use pgwarden_core::{config, StorageArtifact};

use crate::error::Result;
use crate::store::ObjectStore;

/// Lists the orphaned artifacts of `cluster`.
///
/// Artifacts that are already owned, or that lack the serial annotation, are
/// skipped and logged. Read-only.
pub async fn find_orphans(store: &dyn ObjectStore, cluster: &str) -> Result<Vec<StorageArtifact>> {
    let artifacts = store.list_artifacts(cluster).await?;
    let mut orphans = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        if !artifact.meta.is_orphan() {
            tracing::warn!(
                step = "get_orphan_pvcs",
                pvc = artifact.name(),
                "Skipping PVC, it already has an owner"
            );
            continue;
        }
        if artifact.meta.annotation(config::SERIAL_ANNOTATION).is_none() {
            tracing::warn!(
                step = "get_orphan_pvcs",
                pvc = artifact.name(),
                annotation = config::SERIAL_ANNOTATION,
                "Skipping PVC, it has no serial annotation"
            );
            continue;
        }
        orphans.push(artifact);
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use pgwarden_core::{Cluster, ClusterSpec, InstanceRole};

    #[tokio::test]
    async fn test_only_unowned_serialized_artifacts() {
        let store = MemoryStore::new();
        let cluster = store.insert_cluster(Cluster::new("pg", ClusterSpec::default()));

        store.insert_artifact(StorageArtifact::for_instance(&cluster, 1, InstanceRole::Primary));

        let mut orphan = StorageArtifact::for_instance(&cluster, 2, InstanceRole::Standby);
        orphan.meta.owner_references.clear();
        store.insert_artifact(orphan);

        let mut anonymous = StorageArtifact::for_instance(&cluster, 3, InstanceRole::Standby);
        anonymous.meta.owner_references.clear();
        anonymous.meta.annotations.remove(config::SERIAL_ANNOTATION);
        store.insert_artifact(anonymous);

        let orphans = find_orphans(&store, "pg").await.unwrap();
        let names: Vec<_> = orphans.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["pg-2"]);
    }

    #[tokio::test]
    async fn test_other_clusters_are_ignored() {
        let store = MemoryStore::new();
        let other = store.insert_cluster(Cluster::new("other", ClusterSpec::default()));
        let mut orphan = StorageArtifact::for_instance(&other, 1, InstanceRole::Primary);
        orphan.meta.owner_references.clear();
        store.insert_artifact(orphan);

        assert!(find_orphans(&store, "pg").await.unwrap().is_empty());
    }
}
