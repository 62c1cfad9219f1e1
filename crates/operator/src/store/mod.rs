//! Pluggable object store for clusters, volumes and instances.
//!
//! The [`ObjectStore`] trait is the only path by which the reconciler reads or
//! mutates shared state. Implementations must be linearizable per object and
//! must enforce compare-and-swap on every patch: the caller hands back the
//! object exactly as it read it, and the write is rejected with
//! [`Error::Conflict`](crate::error::Error::Conflict) if the stored
//! `resource_version` has moved on. No cross-object transactions are assumed.
//!
//! - **memory**: in-process store for tests, demos and fault injection.
//! - **kubernetes**: Kubernetes backend (`Cluster` custom resource, PVCs, pods, events).

pub mod kubernetes;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use pgwarden_core::{
    Cluster, ClusterEvent, ClusterStatus, Instance, InstanceRole, ObjectMeta, StorageArtifact,
};

use crate::error::Result;

/// Storage abstraction over the platform's object API.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so that one store can serve every reconcile
/// worker concurrently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Gets a cluster by name. Returns `None` if it does not exist.
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>>;

    /// Lists every cluster visible to the operator.
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    /// Replaces the status of `original` if it is still at the version read.
    async fn patch_cluster_status(&self, original: &Cluster, status: ClusterStatus)
        -> Result<Cluster>;

    /// Lists volumes carrying the membership label of `cluster`.
    async fn list_artifacts(&self, cluster: &str) -> Result<Vec<StorageArtifact>>;

    /// Replaces labels, annotations and owner references of `original` if it
    /// is still at the version read.
    async fn patch_artifact_meta(
        &self,
        original: &StorageArtifact,
        meta: ObjectMeta,
    ) -> Result<StorageArtifact>;

    /// Creates a volume. Fails with a conflict if the name is taken.
    async fn create_artifact(&self, artifact: &StorageArtifact) -> Result<StorageArtifact>;

    /// Lists instances belonging to `cluster`.
    async fn list_instances(&self, cluster: &str) -> Result<Vec<Instance>>;

    /// Creates an instance bound to its (already created) volume.
    async fn create_instance(&self, cluster: &Cluster, instance: &Instance) -> Result<Instance>;

    /// Deletes an instance. The backing volume is left untouched.
    async fn delete_instance(&self, instance: &Instance) -> Result<()>;

    /// Records a new role on `original` if it is still at the version read.
    async fn patch_instance_role(&self, original: &Instance, role: InstanceRole)
        -> Result<Instance>;

    /// Appends an event to the cluster's observable event stream.
    async fn record_event(&self, cluster: &Cluster, event: ClusterEvent) -> Result<()>;

    /// Stream of cluster names whose objects (cluster, volumes, instances)
    /// changed. Level-triggered: consumers re-read, never apply deltas.
    fn watch(&self) -> BoxStream<'static, String>;
}
