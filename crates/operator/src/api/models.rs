//! Response data transfer objects for the admin API.
//!
//! All types derive `Serialize` for JSON marshalling via Axum.

use pgwarden_core::{Cluster, ClusterPhase, ClusterStatus, Instance, InstanceRole};
use serde::{Deserialize, Serialize};

/// Response body for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub clusters_count: usize,
    pub queue_depth: usize,
}

/// One entry of `GET /clusters`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub instances: u32,
    pub phase: ClusterPhase,
    pub current_primary: String,
}

impl From<&Cluster> for ClusterSummary {
    fn from(cluster: &Cluster) -> Self {
        Self {
            name: cluster.name().to_string(),
            instances: cluster.spec.instances,
            phase: cluster.status.phase,
            current_primary: cluster.status.current_primary.clone(),
        }
    }
}

/// Response body for `GET /clusters`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListClustersResponse {
    pub clusters: Vec<ClusterSummary>,
}

/// An instance as shown by `GET /clusters/:name`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub name: String,
    pub serial: u32,
    pub role: InstanceRole,
    pub ready: bool,
    pub restart_count: u32,
}

impl From<&Instance> for InstanceInfo {
    fn from(instance: &Instance) -> Self {
        Self {
            name: instance.name.clone(),
            serial: instance.serial,
            role: instance.role,
            ready: instance.ready,
            restart_count: instance.restart_count,
        }
    }
}

/// Response body for `GET /clusters/:name`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail {
    pub name: String,
    pub instances: u32,
    pub status: ClusterStatus,
    pub members: Vec<InstanceInfo>,
}

/// Response body for `POST /clusters/:name/reconcile`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcileQueuedResponse {
    pub cluster: String,
    pub queued: bool,
}
