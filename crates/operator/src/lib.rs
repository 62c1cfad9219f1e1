//! pgwarden-operator: reconcile and failover runtime for replicated
//! PostgreSQL clusters.
//!
//! Domain types and pure algorithms live in `pgwarden-core`.

/// Re-adoption of orphaned volumes after a restore.
pub mod adoption;
/// Admin REST API layer: Axum router, handlers, models, metrics.
pub mod api;
/// Error type shared by every reconcile step.
pub mod error;
/// Primary-failure detection, election and promotion.
pub mod failover;
/// Instance manager client and health probing.
pub mod instance;
/// Orphaned volume discovery.
pub mod orphan;
/// One reconcile cycle per cluster.
pub mod reconciler;
/// Work queue and worker pool.
pub mod scheduler;
/// Object store abstraction and backends.
pub mod store;
/// Demotion, cleanup and provisioning of instances.
pub mod topology;

pub use error::{Error, Result};
pub use reconciler::{ClusterReconciler, ReconcileOutcome, ReconcilerConfig};
