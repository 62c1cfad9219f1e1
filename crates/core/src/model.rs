//! Domain types: clusters, instances, storage artifacts and their metadata.
//!
//! These mirror the subset of the platform objects the reconciler reads and
//! writes. Every object carries an opaque `resource_version`; writes are only
//! accepted by a store when the version still matches what was read.

use crate::config;
use crate::failover::ClusterPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Deterministic instance name: `<cluster>-<serial>`.
pub fn instance_name(cluster: &str, serial: u32) -> String {
    format!("{cluster}-{serial}")
}

/// Reference from a dependent object back to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

/// Metadata common to every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    /// Opaque version token used for compare-and-swap writes.
    #[serde(default)]
    pub resource_version: String,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// `true` when no owner reference is recorded.
    pub fn is_orphan(&self) -> bool {
        self.owner_references.is_empty()
    }

    /// `true` when `owner` is among the recorded owners.
    pub fn is_owned_by(&self, owner: &OwnerReference) -> bool {
        self.owner_references
            .iter()
            .any(|r| r.kind == owner.kind && r.name == owner.name)
    }
}

/// Role of an instance in the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Primary,
    Standby,
}

impl InstanceRole {
    pub fn as_label(self) -> &'static str {
        match self {
            InstanceRole::Primary => config::ROLE_PRIMARY,
            InstanceRole::Standby => config::ROLE_STANDBY,
        }
    }

    /// Parse a role label value. Unknown values yield `None`.
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            config::ROLE_PRIMARY => Some(InstanceRole::Primary),
            config::ROLE_STANDBY | config::ROLE_REPLICA_LEGACY => Some(InstanceRole::Standby),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Declared shape of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Desired number of instances, primary included.
    pub instances: u32,
    #[serde(default = "default_image_name")]
    pub image_name: String,
    #[serde(default = "default_storage_size")]
    pub storage_size: String,
}

fn default_image_name() -> String {
    config::DEFAULT_IMAGE_NAME.to_string()
}

fn default_storage_size() -> String {
    config::DEFAULT_STORAGE_SIZE.to_string()
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            instances: 1,
            image_name: default_image_name(),
            storage_size: default_storage_size(),
        }
    }
}

/// Observed state of a cluster, written only by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Highest serial ever assigned. Never decreases.
    #[serde(default)]
    pub latest_generated_node: u32,
    /// Instance designated as primary; empty when undetermined.
    #[serde(default)]
    pub target_primary: String,
    /// Instance last verified to be serving as primary.
    #[serde(default)]
    pub current_primary: String,
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default)]
    pub phase_reason: String,
    /// When the designated primary was first seen unready, for debouncing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary_failing_since: Option<DateTime<Utc>>,
    /// When the current promotion was committed; set only while `Promoting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_started: Option<DateTime<Utc>>,
}

/// The declared/observed aggregate of one primary and its standbys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub meta: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    pub fn new(name: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            meta: ObjectMeta::new(name),
            spec,
            status: ClusterStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn instance_name(&self, serial: u32) -> String {
        instance_name(&self.meta.name, serial)
    }

    /// Owner reference that dependents of this cluster carry.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: config::CLUSTER_API_VERSION.to_string(),
            kind: config::CLUSTER_KIND.to_string(),
            name: self.meta.name.clone(),
            uid: self.meta.uid.clone(),
            controller: true,
        }
    }
}

/// A durable volume claim backing exactly one instance generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageArtifact {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub storage_size: String,
}

impl StorageArtifact {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Role recorded on the volume, if any.
    pub fn role(&self) -> Option<InstanceRole> {
        self.meta
            .label(config::ROLE_LABEL)
            .and_then(InstanceRole::from_label)
    }

    /// Fresh artifact for `cluster` at `serial`, owned by the cluster.
    pub fn for_instance(cluster: &Cluster, serial: u32, role: InstanceRole) -> Self {
        let mut meta = ObjectMeta::new(cluster.instance_name(serial));
        meta.labels
            .insert(config::CLUSTER_LABEL.to_string(), cluster.name().to_string());
        meta.labels
            .insert(config::ROLE_LABEL.to_string(), role.as_label().to_string());
        meta.annotations
            .insert(config::SERIAL_ANNOTATION.to_string(), serial.to_string());
        meta.annotations.insert(
            config::PVC_STATUS_ANNOTATION.to_string(),
            config::PVC_STATUS_READY.to_string(),
        );
        meta.owner_references.push(cluster.owner_reference());
        Self {
            meta,
            storage_size: cluster.spec.storage_size.clone(),
        }
    }
}

/// A running database process bound to one storage artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    pub cluster: String,
    pub serial: u32,
    pub role: InstanceRole,
    /// Platform-level readiness (container running and readiness probe passing).
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub restart_count: u32,
    /// Address of the instance manager endpoint, once scheduled.
    #[serde(default)]
    pub address: Option<String>,
    /// Name of the backing storage artifact.
    pub artifact: String,
    #[serde(default)]
    pub resource_version: String,
}

impl Instance {
    /// Desired (not yet running) instance for `cluster` at `serial`.
    pub fn for_cluster(cluster: &Cluster, serial: u32, role: InstanceRole) -> Self {
        let name = cluster.instance_name(serial);
        Self {
            artifact: name.clone(),
            name,
            cluster: cluster.name().to_string(),
            serial,
            role,
            ready: false,
            restart_count: 0,
            address: None,
            resource_version: String::new(),
        }
    }
}

/// Severity of a cluster event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// An operator-visible event attached to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEvent {
    #[serde(rename = "type")]
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

impl ClusterEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}
