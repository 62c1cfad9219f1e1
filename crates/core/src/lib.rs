//! # pgwarden-core
//!
//! Domain model and pure algorithms behind the pgwarden operator: serial
//! bookkeeping recovered from volume metadata, successor election, and the
//! failover phase machine.
//!
//! This crate has zero async dependencies. Everything that talks to the
//! platform or to database instances lives in `pgwarden-operator`.

/// Capped exponential backoff for reconcile retries.
pub mod backoff;
/// Global configuration constants: metadata keys, timeouts, defaults.
pub mod config;
/// Successor ranking by replication position and serial.
pub mod election;
/// Failover phases and primary-loss debouncing.
pub mod failover;
/// PostgreSQL log sequence numbers.
pub mod lsn;
/// Clusters, instances, storage artifacts and object metadata.
pub mod model;
/// Serial parsing and reduction over volume metadata.
pub mod serial;

pub use failover::ClusterPhase;
pub use lsn::Lsn;
pub use model::{
    instance_name, Cluster, ClusterEvent, ClusterSpec, ClusterStatus, EventType, Instance,
    InstanceRole, ObjectMeta, OwnerReference, StorageArtifact,
};
pub use serial::{SerialError, SerialSummary};
