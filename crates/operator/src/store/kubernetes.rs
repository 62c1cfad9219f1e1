//! Kubernetes-backed object store built on [kube](https://docs.rs/kube).
//!
//! Clusters are the `postgresql.cnpg.io/v1` `Cluster` custom resource, storage
//! artifacts are `PersistentVolumeClaim`s and instances are `Pod`s. Every patch
//! is a JSON merge patch that carries `metadata.resourceVersion`, which makes
//! the API server reject it with `409 Conflict` when the object moved on.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Event as KubeEvent, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as KubeObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, CustomResource, ResourceExt};
use pgwarden_core::serial::parse_serial;
use pgwarden_core::{
    config, Cluster, ClusterEvent, ClusterPhase, ClusterSpec, ClusterStatus, EventType, Instance,
    InstanceRole, ObjectMeta, OwnerReference, StorageArtifact,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::ObjectStore;
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "pgwarden";
const DATA_VOLUME_NAME: &str = "pgdata";
const DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";

/// Spec of the `Cluster` custom resource.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    root = "ClusterResource",
    namespaced,
    status = "ClusterResourceStatus",
    shortname = "pgc",
    printcolumn = r#"{"name":"Primary","type":"string","jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceSpec {
    pub instances: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
}

/// Status subresource of the `Cluster` custom resource.
///
/// Optional fields serialize as `null` so a merge patch clears them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceStatus {
    #[serde(default)]
    pub latest_generated_node: u32,
    #[serde(default)]
    pub target_primary: String,
    #[serde(default)]
    pub current_primary: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub phase_reason: String,
    #[serde(default)]
    pub current_primary_failing_since: Option<String>,
    #[serde(default)]
    pub promotion_started: Option<String>,
}

impl From<&ClusterStatus> for ClusterResourceStatus {
    fn from(status: &ClusterStatus) -> Self {
        Self {
            latest_generated_node: status.latest_generated_node,
            target_primary: status.target_primary.clone(),
            current_primary: status.current_primary.clone(),
            phase: status.phase.to_string(),
            phase_reason: status.phase_reason.clone(),
            current_primary_failing_since: status
                .current_primary_failing_since
                .map(|t| t.to_rfc3339()),
            promotion_started: status.promotion_started.map(|t| t.to_rfc3339()),
        }
    }
}

impl From<&ClusterResourceStatus> for ClusterStatus {
    fn from(status: &ClusterResourceStatus) -> Self {
        Self {
            latest_generated_node: status.latest_generated_node,
            target_primary: status.target_primary.clone(),
            current_primary: status.current_primary.clone(),
            phase: status.phase.parse().unwrap_or(ClusterPhase::Bootstrapping),
            phase_reason: status.phase_reason.clone(),
            current_primary_failing_since: parse_time(status.current_primary_failing_since.as_deref()),
            promotion_started: parse_time(status.promotion_started.as_deref()),
        }
    }
}

fn parse_time(raw: Option<&str>) -> Option<chrono::DateTime<chrono::Utc>> {
    raw.and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
}

fn meta_from_kube(meta: &KubeObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        owner_references: meta
            .owner_references
            .iter()
            .flatten()
            .map(|r| OwnerReference {
                api_version: r.api_version.clone(),
                kind: r.kind.clone(),
                name: r.name.clone(),
                uid: r.uid.clone(),
                controller: r.controller.unwrap_or(false),
            })
            .collect(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
    }
}

fn owner_reference_json(owner: &OwnerReference) -> Value {
    json!({
        "apiVersion": owner.api_version,
        "kind": owner.kind,
        "name": owner.name,
        "uid": owner.uid,
        "controller": owner.controller,
        "blockOwnerDeletion": true,
    })
}

/// Converts a `Cluster` resource into the domain model.
pub fn cluster_from_resource(resource: &ClusterResource) -> Cluster {
    let defaults = ClusterSpec::default();
    Cluster {
        meta: meta_from_kube(&resource.metadata),
        spec: ClusterSpec {
            instances: resource.spec.instances,
            image_name: resource
                .spec
                .image_name
                .clone()
                .unwrap_or(defaults.image_name),
            storage_size: resource
                .spec
                .storage_size
                .clone()
                .unwrap_or(defaults.storage_size),
        },
        status: resource
            .status
            .as_ref()
            .map(ClusterStatus::from)
            .unwrap_or_default(),
    }
}

/// Converts a PVC into a storage artifact.
pub fn artifact_from_pvc(pvc: &PersistentVolumeClaim) -> StorageArtifact {
    let storage_size = pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone())
        .unwrap_or_default();
    StorageArtifact {
        meta: meta_from_kube(&pvc.metadata),
        storage_size,
    }
}

/// Converts a pod into an instance. Pods without cluster or serial metadata
/// are not instances and yield `None`.
pub fn instance_from_pod(pod: &Pod) -> Option<Instance> {
    let meta = meta_from_kube(&pod.metadata);
    let cluster = meta.label(config::CLUSTER_LABEL)?.to_string();
    let serial = parse_serial(&meta).ok()?;
    let role = meta
        .label(config::ROLE_LABEL)
        .and_then(InstanceRole::from_label)
        .unwrap_or(InstanceRole::Standby);
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let restart_count = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| {
            cs.iter()
                .find(|c| c.name == config::POSTGRES_CONTAINER_NAME)
        })
        .map(|c| u32::try_from(c.restart_count).unwrap_or(0))
        .unwrap_or(0);
    let address = status.and_then(|s| s.pod_ip.clone());
    let artifact = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .and_then(|volumes| {
            volumes
                .iter()
                .find_map(|v| v.persistent_volume_claim.as_ref())
        })
        .map(|claim| claim.claim_name.clone())
        .unwrap_or_else(|| meta.name.clone());
    Some(Instance {
        name: meta.name.clone(),
        cluster,
        serial,
        role,
        ready,
        restart_count,
        address,
        artifact,
        resource_version: meta.resource_version,
    })
}

fn string_map_patch(
    original: &std::collections::BTreeMap<String, String>,
    desired: &std::collections::BTreeMap<String, String>,
) -> Value {
    let mut map = Map::new();
    for (k, v) in desired {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    for k in original.keys() {
        if !desired.contains_key(k) {
            map.insert(k.clone(), Value::Null);
        }
    }
    Value::Object(map)
}

/// JSON merge patch turning `original` metadata into `desired`, guarded by
/// the original resource version. Removed keys are sent as `null`.
pub fn meta_merge_patch(original: &ObjectMeta, desired: &ObjectMeta) -> Value {
    let owners: Vec<Value> = desired
        .owner_references
        .iter()
        .map(owner_reference_json)
        .collect();
    json!({
        "metadata": {
            "resourceVersion": original.resource_version,
            "labels": string_map_patch(&original.labels, &desired.labels),
            "annotations": string_map_patch(&original.annotations, &desired.annotations),
            "ownerReferences": owners,
        }
    })
}

fn pvc_manifest(artifact: &StorageArtifact, namespace: &str) -> Value {
    let owners: Vec<Value> = artifact
        .meta
        .owner_references
        .iter()
        .map(owner_reference_json)
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": artifact.meta.name,
            "namespace": namespace,
            "labels": artifact.meta.labels,
            "annotations": artifact.meta.annotations,
            "ownerReferences": owners,
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": artifact.storage_size } },
        }
    })
}

fn pod_manifest(cluster: &Cluster, instance: &Instance, namespace: &str, port: u16) -> Value {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(config::CLUSTER_LABEL, cluster.name().to_string());
    labels.insert(config::ROLE_LABEL, instance.role.as_label().to_string());
    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(config::SERIAL_ANNOTATION, instance.serial.to_string());
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": instance.name,
            "namespace": namespace,
            "labels": labels,
            "annotations": annotations,
            "ownerReferences": [owner_reference_json(&cluster.owner_reference())],
        },
        "spec": {
            "hostname": instance.name,
            "containers": [{
                "name": config::POSTGRES_CONTAINER_NAME,
                "image": cluster.spec.image_name,
                "env": [
                    { "name": "PGDATA", "value": config::PG_DATA_PATH },
                    { "name": "CLUSTER_NAME", "value": cluster.name() },
                    { "name": "POD_NAME", "value": instance.name },
                ],
                "ports": [{ "name": "status", "containerPort": port }],
                "readinessProbe": { "httpGet": { "path": "/readyz", "port": port } },
                "volumeMounts": [{ "name": DATA_VOLUME_NAME, "mountPath": DATA_MOUNT_PATH }],
            }],
            "volumes": [{
                "name": DATA_VOLUME_NAME,
                "persistentVolumeClaim": { "claimName": instance.artifact },
            }],
        }
    })
}

fn map_kube_err(kind: &'static str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 409 => Error::conflict(kind, name),
        kube::Error::Api(ref resp) if resp.code == 404 => Error::not_found(kind, name),
        other => Error::store_with_source(format!("{kind} '{name}'"), other),
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &'static str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::store_with_source(format!("building {kind} manifest"), e))
}

/// [`ObjectStore`] backed by the Kubernetes API of one namespace.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
    instance_port: u16,
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>, instance_port: u16) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            instance_port,
        }
    }

    fn clusters(&self) -> Api<ClusterResource> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn events(&self) -> Api<KubeEvent> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn cluster_selector(cluster: &str) -> ListParams {
        ListParams::default().labels(&format!("{}={}", config::CLUSTER_LABEL, cluster))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        let resource = self
            .clusters()
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err("cluster", name, e))?;
        Ok(resource.as_ref().map(cluster_from_resource))
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let list = self
            .clusters()
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err("cluster", "*", e))?;
        Ok(list.items.iter().map(cluster_from_resource).collect())
    }

    async fn patch_cluster_status(
        &self,
        original: &Cluster,
        status: ClusterStatus,
    ) -> Result<Cluster> {
        let patch = json!({
            "metadata": { "resourceVersion": original.meta.resource_version },
            "status": ClusterResourceStatus::from(&status),
        });
        let updated = self
            .clusters()
            .patch_status(original.name(), &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err("cluster", original.name(), e))?;
        Ok(cluster_from_resource(&updated))
    }

    async fn list_artifacts(&self, cluster: &str) -> Result<Vec<StorageArtifact>> {
        let list = self
            .pvcs()
            .list(&Self::cluster_selector(cluster))
            .await
            .map_err(|e| map_kube_err("artifact", cluster, e))?;
        Ok(list.items.iter().map(artifact_from_pvc).collect())
    }

    async fn patch_artifact_meta(
        &self,
        original: &StorageArtifact,
        meta: ObjectMeta,
    ) -> Result<StorageArtifact> {
        let patch = meta_merge_patch(&original.meta, &meta);
        let updated = self
            .pvcs()
            .patch(original.name(), &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err("artifact", original.name(), e))?;
        Ok(artifact_from_pvc(&updated))
    }

    async fn create_artifact(&self, artifact: &StorageArtifact) -> Result<StorageArtifact> {
        let pvc: PersistentVolumeClaim =
            decode("pvc", pvc_manifest(artifact, &self.namespace))?;
        let created = self
            .pvcs()
            .create(&PostParams::default(), &pvc)
            .await
            .map_err(|e| map_kube_err("artifact", artifact.name(), e))?;
        Ok(artifact_from_pvc(&created))
    }

    async fn list_instances(&self, cluster: &str) -> Result<Vec<Instance>> {
        let list = self
            .pods()
            .list(&Self::cluster_selector(cluster))
            .await
            .map_err(|e| map_kube_err("instance", cluster, e))?;
        Ok(list.items.iter().filter_map(instance_from_pod).collect())
    }

    async fn create_instance(&self, cluster: &Cluster, instance: &Instance) -> Result<Instance> {
        let pod: Pod = decode(
            "pod",
            pod_manifest(cluster, instance, &self.namespace, self.instance_port),
        )?;
        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| map_kube_err("instance", &instance.name, e))?;
        instance_from_pod(&created)
            .ok_or_else(|| Error::store(format!("created pod '{}' lacks identity", instance.name)))
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        self.pods()
            .delete(&instance.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err("instance", &instance.name, e))?;
        Ok(())
    }

    async fn patch_instance_role(
        &self,
        original: &Instance,
        role: InstanceRole,
    ) -> Result<Instance> {
        let patch = json!({
            "metadata": {
                "resourceVersion": original.resource_version,
                "labels": { (config::ROLE_LABEL): role.as_label() },
            }
        });
        let updated = self
            .pods()
            .patch(&original.name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err("instance", &original.name, e))?;
        instance_from_pod(&updated)
            .ok_or_else(|| Error::store(format!("pod '{}' lost its identity", original.name)))
    }

    async fn record_event(&self, cluster: &Cluster, event: ClusterEvent) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let type_ = match event.type_ {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": {
                "generateName": format!("{}.", cluster.name()),
                "namespace": self.namespace,
            },
            "involvedObject": {
                "apiVersion": config::CLUSTER_API_VERSION,
                "kind": config::CLUSTER_KIND,
                "name": cluster.name(),
                "namespace": self.namespace,
                "uid": cluster.meta.uid,
            },
            "reason": event.reason,
            "message": event.message,
            "type": type_,
            "count": 1,
            "firstTimestamp": now,
            "lastTimestamp": now,
            "source": { "component": FIELD_MANAGER },
        });
        let kube_event: KubeEvent = decode("event", manifest)?;
        self.events()
            .create(&PostParams::default(), &kube_event)
            .await
            .map_err(|e| map_kube_err("event", cluster.name(), e))?;
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, String> {
        let labelled = watcher::Config::default().labels(config::CLUSTER_LABEL);
        let clusters = watcher(self.clusters(), watcher::Config::default())
            .default_backoff()
            .touched_objects()
            .filter_map(|r| async move {
                match r {
                    Ok(c) => Some(c.name_any()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Cluster watch error");
                        None
                    }
                }
            });
        let pvcs = watcher(self.pvcs(), labelled.clone())
            .default_backoff()
            .touched_objects()
            .filter_map(|r| async move {
                r.ok()
                    .and_then(|p| p.labels().get(config::CLUSTER_LABEL).cloned())
            });
        let pods = watcher(self.pods(), labelled)
            .default_backoff()
            .touched_objects()
            .filter_map(|r| async move {
                r.ok()
                    .and_then(|p| p.labels().get(config::CLUSTER_LABEL).cloned())
            });
        stream::select_all([clusters.boxed(), pvcs.boxed(), pods.boxed()]).boxed()
    }
}
