//! Simulated database fleet for integration tests.
//!
//! [`Fleet`] plays both the kubelet (starting created instances, reporting
//! readiness and restarts into the [`MemoryStore`]) and the instance managers
//! (answering probes, promoting, demoting, streaming rows from the primary to
//! its standbys).

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pgwarden_core::{Cluster, ClusterSpec, Lsn};
use pgwarden_operator::instance::{InstanceClient, InstanceStatus};
use pgwarden_operator::store::memory::MemoryStore;
use pgwarden_operator::store::ObjectStore;
use pgwarden_operator::{ClusterReconciler, Error, ReconcileOutcome, ReconcilerConfig, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Node {
    pub up: bool,
    pub primary: bool,
    pub rows: Vec<String>,
}

impl Node {
    fn lsn(&self) -> Lsn {
        Lsn(self.rows.len() as u64 * 0x28)
    }
}

#[derive(Default)]
pub struct Fleet {
    nodes: Mutex<BTreeMap<String, Node>>,
    promotions: Mutex<Vec<String>>,
    demotions: Mutex<Vec<String>>,
    /// Nodes that accept promote requests but stay in recovery.
    stuck: Mutex<HashSet<String>>,
}

impl Fleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().get(name).cloned()
    }

    pub fn promotions(&self) -> Vec<String> {
        self.promotions.lock().clone()
    }

    pub fn demotions(&self) -> Vec<String> {
        self.demotions.lock().clone()
    }

    /// `name` acknowledges promote requests without ever leaving recovery.
    pub fn hold_in_recovery(&self, name: &str) {
        self.stuck.lock().insert(name.to_string());
    }

    pub fn release(&self, name: &str) {
        self.stuck.lock().remove(name);
    }

    /// Live nodes reporting themselves primary.
    pub fn live_primaries(&self) -> Vec<String> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, n)| n.up && n.primary)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Appends a row on `primary`. Standbys receive it on the next sync.
    pub fn write(&self, primary: &str, row: &str) {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(primary).expect("unknown node");
        assert!(node.up && node.primary, "writes go to a live primary");
        node.rows.push(row.to_string());
    }

    /// Takes the engine down; the pod turns unready.
    pub fn crash(&self, store: &MemoryStore, name: &str) {
        if let Some(node) = self.nodes.lock().get_mut(name) {
            node.up = false;
        }
        store.update_instance(name, |i| i.ready = false);
    }

    /// Restarts the container. The engine comes back in whatever role it had.
    pub fn restart(&self, store: &MemoryStore, name: &str) {
        if let Some(node) = self.nodes.lock().get_mut(name) {
            node.up = true;
        }
        store.update_instance(name, |i| {
            i.ready = true;
            i.restart_count += 1;
        });
    }

    /// One kubelet/replication step for `cluster`.
    pub async fn sync(&self, store: &MemoryStore, cluster: &str) {
        let target = store
            .cluster(cluster)
            .map(|c| c.status.target_primary)
            .unwrap_or_default();
        let instances = store.list_instances(cluster).await.expect("list instances");

        let mut nodes = self.nodes.lock();
        nodes.retain(|name, _| instances.iter().any(|i| &i.name == name));

        let source = nodes
            .iter()
            .find(|(name, n)| n.up && n.primary && **name == target)
            .map(|(_, n)| n.rows.clone());

        for instance in &instances {
            if !nodes.contains_key(&instance.name) {
                let first_primary = instance.name == target && source.is_none();
                let node = Node {
                    up: true,
                    primary: first_primary,
                    // Base backup from the primary.
                    rows: source.clone().unwrap_or_default(),
                };
                nodes.insert(instance.name.clone(), node);
            }
        }
        if let Some(rows) = &source {
            for node in nodes.values_mut().filter(|n| n.up && !n.primary) {
                node.rows = rows.clone();
            }
        }

        let readiness: Vec<(String, bool)> =
            nodes.iter().map(|(name, n)| (name.clone(), n.up)).collect();
        drop(nodes);
        for (idx, (name, up)) in readiness.into_iter().enumerate() {
            let current = store.instance(&name);
            let needs_update = current
                .map(|i| i.ready != up || i.address.is_none())
                .unwrap_or(false);
            if needs_update {
                store.update_instance(&name, |i| {
                    i.ready = up;
                    i.address = Some(format!("10.0.0.{}", idx + 10));
                });
            }
        }
    }
}

#[async_trait]
impl InstanceClient for Fleet {
    async fn status(&self, instance: &pgwarden_core::Instance) -> Result<InstanceStatus> {
        let nodes = self.nodes.lock();
        match nodes.get(&instance.name) {
            Some(node) if node.up => Ok(InstanceStatus {
                is_primary: node.primary,
                in_recovery: !node.primary,
                received_lsn: Some(node.lsn()),
                replay_lsn: Some(node.lsn()),
            }),
            _ => Err(Error::not_ready(&instance.name, "connection refused")),
        }
    }

    async fn promote(&self, instance: &pgwarden_core::Instance) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(&instance.name)
            .filter(|n| n.up)
            .ok_or_else(|| Error::not_ready(&instance.name, "connection refused"))?;
        if self.stuck.lock().contains(&instance.name) {
            return Ok(());
        }
        node.primary = true;
        drop(nodes);
        self.promotions.lock().push(instance.name.clone());
        Ok(())
    }

    async fn demote(&self, instance: &pgwarden_core::Instance, _primary: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(&instance.name)
            .filter(|n| n.up)
            .ok_or_else(|| Error::not_ready(&instance.name, "connection refused"))?;
        node.primary = false;
        drop(nodes);
        self.demotions.lock().push(instance.name.clone());
        Ok(())
    }
}

pub fn test_config() -> ReconcilerConfig {
    ReconcilerConfig {
        probe_timeout: Duration::from_secs(1),
        primary_grace: Duration::ZERO,
        failover_timeout: Duration::from_secs(300),
        transition_poll: Duration::from_millis(10),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fleet: Arc<Fleet>,
    pub reconciler: ClusterReconciler,
}

impl Harness {
    pub fn new(config: ReconcilerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let fleet = Fleet::new();
        let reconciler = ClusterReconciler::new(store.clone(), fleet.clone(), config);
        Self {
            store,
            fleet,
            reconciler,
        }
    }

    pub fn create_cluster(&self, name: &str, instances: u32) -> Cluster {
        self.store.insert_cluster(Cluster::new(
            name,
            ClusterSpec {
                instances,
                ..Default::default()
            },
        ))
    }

    pub fn cluster(&self, name: &str) -> Cluster {
        self.store.cluster(name).expect("cluster exists")
    }

    /// One reconcile cycle followed by one fleet step.
    pub async fn step(&self, name: &str) -> ReconcileOutcome {
        let outcome = self.reconciler.reconcile(name).await.expect("reconcile");
        self.fleet.sync(&self.store, name).await;
        outcome
    }

    /// Steps until the cluster reports `Healthy` with nothing left to do.
    pub async fn settle(&self, name: &str) -> Cluster {
        for _ in 0..20 {
            let outcome = self.step(name).await;
            if outcome.phase == pgwarden_core::ClusterPhase::Healthy
                && outcome.requeue_after.is_none()
            {
                return self.cluster(name);
            }
        }
        panic!("cluster {name} did not settle: {:?}", self.cluster(name).status);
    }
}
