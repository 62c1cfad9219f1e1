//! In-memory object store.
//!
//! Single-process stand-in for the platform's object API, used by tests, the
//! `--store memory` demo mode, and fault-injection scenarios. Every write bumps
//! a global version counter and is checked against the version the caller
//! read, exactly like the real API server does with `resourceVersion`.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use pgwarden_core::{
    config, Cluster, ClusterEvent, ClusterStatus, Instance, InstanceRole, ObjectMeta,
    StorageArtifact,
};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::broadcast;

use super::ObjectStore;
use crate::error::{Error, Result};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    version: u64,
    clusters: BTreeMap<String, Cluster>,
    artifacts: BTreeMap<String, StorageArtifact>,
    instances: BTreeMap<String, Instance>,
    events: Vec<(String, ClusterEvent)>,
    /// Artifact names whose next metadata patch fails with a store error.
    failing_artifact_patches: HashSet<String>,
    /// Number of successful artifact metadata patches.
    artifact_patches: u64,
    /// Cluster names whose next status patch loses a race to another writer.
    racing_status_patches: HashSet<String>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Thread-safe in-memory [`ObjectStore`].
pub struct MemoryStore {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            changes,
        }
    }

    fn notify(&self, cluster: &str) {
        // No subscribers is fine.
        let _ = self.changes.send(cluster.to_string());
    }

    /// Inserts or replaces a cluster, assigning a uid when missing.
    pub fn insert_cluster(&self, mut cluster: Cluster) -> Cluster {
        let mut inner = self.inner.write();
        if cluster.meta.uid.is_empty() {
            cluster.meta.uid = format!("uid-{}", cluster.meta.name);
        }
        cluster.meta.resource_version = inner.next_version();
        inner
            .clusters
            .insert(cluster.meta.name.clone(), cluster.clone());
        drop(inner);
        self.notify(cluster.name());
        cluster
    }

    /// Deletes a cluster and cascades to the volumes and instances it owns.
    /// Orphaned volumes are retained.
    pub fn delete_cluster(&self, name: &str) -> Option<Cluster> {
        let mut inner = self.inner.write();
        let removed = inner.clusters.remove(name)?;
        let owner = removed.owner_reference();
        inner.artifacts.retain(|_, a| !a.meta.is_owned_by(&owner));
        inner.instances.retain(|_, i| i.cluster != name);
        drop(inner);
        self.notify(name);
        Some(removed)
    }

    /// Inserts or replaces a volume as-is (ownership untouched).
    pub fn insert_artifact(&self, mut artifact: StorageArtifact) -> StorageArtifact {
        let mut inner = self.inner.write();
        artifact.meta.resource_version = inner.next_version();
        inner
            .artifacts
            .insert(artifact.meta.name.clone(), artifact.clone());
        drop(inner);
        if let Some(cluster) = artifact.meta.label(config::CLUSTER_LABEL) {
            self.notify(cluster);
        }
        artifact
    }

    /// Removes a volume, as an administrator deleting a PVC would.
    pub fn remove_artifact(&self, name: &str) -> Option<StorageArtifact> {
        let removed = self.inner.write().artifacts.remove(name)?;
        if let Some(cluster) = removed.meta.label(config::CLUSTER_LABEL) {
            self.notify(cluster);
        }
        Some(removed)
    }

    pub fn artifact(&self, name: &str) -> Option<StorageArtifact> {
        self.inner.read().artifacts.get(name).cloned()
    }

    pub fn cluster(&self, name: &str) -> Option<Cluster> {
        self.inner.read().clusters.get(name).cloned()
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.inner.read().instances.get(name).cloned()
    }

    /// Applies `f` to a stored instance, simulating kubelet-side changes
    /// (readiness, restarts, address assignment).
    pub fn update_instance<F>(&self, name: &str, f: F) -> Option<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let mut inner = self.inner.write();
        let version = inner.next_version();
        let instance = inner.instances.get_mut(name)?;
        f(instance);
        instance.resource_version = version;
        let updated = instance.clone();
        drop(inner);
        self.notify(&updated.cluster);
        Some(updated)
    }

    /// Removes an instance, as a forced pod deletion would.
    pub fn remove_instance(&self, name: &str) -> Option<Instance> {
        let removed = self.inner.write().instances.remove(name)?;
        self.notify(&removed.cluster);
        Some(removed)
    }

    /// Events recorded for `cluster`, oldest first.
    pub fn events(&self, cluster: &str) -> Vec<ClusterEvent> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|(c, _)| c == cluster)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Makes the next metadata patch of artifact `name` fail with a store error.
    pub fn fail_next_artifact_patch(&self, name: &str) {
        self.inner
            .write()
            .failing_artifact_patches
            .insert(name.to_string());
    }

    /// Makes the next status patch of cluster `name` lose a race: another
    /// writer bumps the cluster's version first, so the patch conflicts.
    pub fn race_next_status_patch(&self, name: &str) {
        self.inner
            .write()
            .racing_status_patches
            .insert(name.to_string());
    }

    /// Number of successful artifact metadata patches so far.
    pub fn artifact_patch_count(&self) -> u64 {
        self.inner.read().artifact_patches
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.inner.read().clusters.get(name).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.inner.read().clusters.values().cloned().collect())
    }

    async fn patch_cluster_status(
        &self,
        original: &Cluster,
        status: ClusterStatus,
    ) -> Result<Cluster> {
        let mut inner = self.inner.write();
        if inner.racing_status_patches.remove(original.name()) {
            let version = inner.next_version();
            if let Some(current) = inner.clusters.get_mut(original.name()) {
                current.meta.resource_version = version;
            }
        }
        let version = inner.next_version();
        let current = inner
            .clusters
            .get_mut(original.name())
            .ok_or_else(|| Error::not_found("cluster", original.name()))?;
        if current.meta.resource_version != original.meta.resource_version {
            return Err(Error::conflict("cluster", original.name()));
        }
        current.status = status;
        current.meta.resource_version = version;
        let updated = current.clone();
        drop(inner);
        self.notify(updated.name());
        Ok(updated)
    }

    async fn list_artifacts(&self, cluster: &str) -> Result<Vec<StorageArtifact>> {
        Ok(self
            .inner
            .read()
            .artifacts
            .values()
            .filter(|a| a.meta.label(config::CLUSTER_LABEL) == Some(cluster))
            .cloned()
            .collect())
    }

    async fn patch_artifact_meta(
        &self,
        original: &StorageArtifact,
        meta: ObjectMeta,
    ) -> Result<StorageArtifact> {
        let mut inner = self.inner.write();
        if inner.failing_artifact_patches.remove(original.name()) {
            return Err(Error::store(format!(
                "injected failure patching artifact '{}'",
                original.name()
            )));
        }
        let version = inner.next_version();
        let current = inner
            .artifacts
            .get_mut(original.name())
            .ok_or_else(|| Error::not_found("artifact", original.name()))?;
        if current.meta.resource_version != original.meta.resource_version {
            return Err(Error::conflict("artifact", original.name()));
        }
        current.meta.labels = meta.labels;
        current.meta.annotations = meta.annotations;
        current.meta.owner_references = meta.owner_references;
        current.meta.resource_version = version;
        let updated = current.clone();
        inner.artifact_patches += 1;
        drop(inner);
        if let Some(cluster) = updated.meta.label(config::CLUSTER_LABEL) {
            self.notify(cluster);
        }
        Ok(updated)
    }

    async fn create_artifact(&self, artifact: &StorageArtifact) -> Result<StorageArtifact> {
        let mut inner = self.inner.write();
        if inner.artifacts.contains_key(artifact.name()) {
            return Err(Error::conflict("artifact", artifact.name()));
        }
        let mut created = artifact.clone();
        created.meta.resource_version = inner.next_version();
        inner
            .artifacts
            .insert(created.meta.name.clone(), created.clone());
        drop(inner);
        if let Some(cluster) = created.meta.label(config::CLUSTER_LABEL) {
            self.notify(cluster);
        }
        Ok(created)
    }

    async fn list_instances(&self, cluster: &str) -> Result<Vec<Instance>> {
        Ok(self
            .inner
            .read()
            .instances
            .values()
            .filter(|i| i.cluster == cluster)
            .cloned()
            .collect())
    }

    async fn create_instance(&self, cluster: &Cluster, instance: &Instance) -> Result<Instance> {
        let mut inner = self.inner.write();
        if !inner.clusters.contains_key(cluster.name()) {
            return Err(Error::not_found("cluster", cluster.name()));
        }
        if inner.instances.contains_key(&instance.name) {
            return Err(Error::conflict("instance", instance.name.clone()));
        }
        let mut created = instance.clone();
        created.resource_version = inner.next_version();
        inner
            .instances
            .insert(created.name.clone(), created.clone());
        drop(inner);
        self.notify(&created.cluster);
        Ok(created)
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        let removed = self.inner.write().instances.remove(&instance.name);
        match removed {
            Some(removed) => {
                self.notify(&removed.cluster);
                Ok(())
            }
            None => Err(Error::not_found("instance", instance.name.clone())),
        }
    }

    async fn patch_instance_role(
        &self,
        original: &Instance,
        role: InstanceRole,
    ) -> Result<Instance> {
        let mut inner = self.inner.write();
        let version = inner.next_version();
        let current = inner
            .instances
            .get_mut(&original.name)
            .ok_or_else(|| Error::not_found("instance", original.name.clone()))?;
        if current.resource_version != original.resource_version {
            return Err(Error::conflict("instance", original.name.clone()));
        }
        current.role = role;
        current.resource_version = version;
        let updated = current.clone();
        drop(inner);
        self.notify(&updated.cluster);
        Ok(updated)
    }

    async fn record_event(&self, cluster: &Cluster, event: ClusterEvent) -> Result<()> {
        self.inner
            .write()
            .events
            .push((cluster.name().to_string(), event));
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, String> {
        let rx = self.changes.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(name) => return Some((name, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Watch consumer lagged by {} changes", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgwarden_core::ClusterSpec;

    fn cluster() -> Cluster {
        Cluster::new("pg", ClusterSpec::default())
    }

    #[tokio::test]
    async fn test_status_patch_is_compare_and_swap() {
        let store = MemoryStore::new();
        let original = store.insert_cluster(cluster());

        let mut status = original.status.clone();
        status.latest_generated_node = 1;
        let updated = store
            .patch_cluster_status(&original, status.clone())
            .await
            .unwrap();
        assert_ne!(updated.meta.resource_version, original.meta.resource_version);

        // A second writer still holding the stale copy is rejected.
        status.latest_generated_node = 7;
        let err = store.patch_cluster_status(&original, status).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.cluster("pg").unwrap().status.latest_generated_node, 1);
    }

    #[tokio::test]
    async fn test_patch_after_delete_is_not_found() {
        let store = MemoryStore::new();
        let original = store.insert_cluster(cluster());
        store.delete_cluster("pg");
        let err = store
            .patch_cluster_status(&original, ClusterStatus::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_cascades_only_to_owned_artifacts() {
        let store = MemoryStore::new();
        let c = store.insert_cluster(cluster());
        store.insert_artifact(StorageArtifact::for_instance(&c, 1, InstanceRole::Primary));
        let mut orphan = StorageArtifact::for_instance(&c, 2, InstanceRole::Standby);
        orphan.meta.owner_references.clear();
        store.insert_artifact(orphan);

        store.delete_cluster("pg");
        let left = store.list_artifacts("pg").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name(), "pg-2");
    }

    #[tokio::test]
    async fn test_injected_artifact_failure_fires_once() {
        let store = MemoryStore::new();
        let c = store.insert_cluster(cluster());
        let a = store.insert_artifact(StorageArtifact::for_instance(&c, 1, InstanceRole::Primary));
        store.fail_next_artifact_patch("pg-1");
        assert!(store.patch_artifact_meta(&a, a.meta.clone()).await.is_err());
        assert!(store.patch_artifact_meta(&a, a.meta.clone()).await.is_ok());
        assert_eq!(store.artifact_patch_count(), 1);
    }

    #[tokio::test]
    async fn test_raced_status_patch_conflicts_once() {
        let store = MemoryStore::new();
        let original = store.insert_cluster(cluster());
        store.race_next_status_patch("pg");

        let err = store
            .patch_cluster_status(&original, original.status.clone())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let fresh = store.cluster("pg").unwrap();
        assert_ne!(fresh.meta.resource_version, original.meta.resource_version);
        assert!(store
            .patch_cluster_status(&fresh, fresh.status.clone())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_watch_reports_touched_cluster() {
        let store = MemoryStore::new();
        let mut watch = store.watch();
        store.insert_cluster(cluster());
        assert_eq!(watch.next().await.as_deref(), Some("pg"));
    }
}
