//! Global configuration constants for pgwarden.
//!
//! Metadata keys shared with the instance manager, timing defaults for the
//! failover state machine, and scheduler tuning are defined here. These are
//! compile-time constants; runtime configuration is handled via CLI arguments
//! and environment variables in the operator's `main.rs`.

/// Label carrying the name of the cluster an object belongs to.
pub const CLUSTER_LABEL: &str = "cnpg.io/cluster";

/// Label carrying the role an instance (or its volume) was created with.
pub const ROLE_LABEL: &str = "cnpg.io/instanceRole";

/// Value of [`ROLE_LABEL`] for the primary instance.
pub const ROLE_PRIMARY: &str = "primary";

/// Value of [`ROLE_LABEL`] for standby instances.
pub const ROLE_STANDBY: &str = "standby";

/// Legacy value of [`ROLE_LABEL`] for standby instances, accepted on read.
pub const ROLE_REPLICA_LEGACY: &str = "replica";

/// Annotation holding the instance serial a volume was provisioned for.
///
/// Survives instance deletion, which is what makes re-adoption possible.
pub const SERIAL_ANNOTATION: &str = "cnpg.io/nodeSerial";

/// Annotation tracking the lifecycle status of a volume.
pub const PVC_STATUS_ANNOTATION: &str = "cnpg.io/pvcStatus";

/// [`PVC_STATUS_ANNOTATION`] value for a volume ready to back an instance.
pub const PVC_STATUS_READY: &str = "ready";

/// Hibernation snapshot of the cluster manifest. Stripped on adoption.
pub const HIBERNATE_MANIFEST_ANNOTATION: &str = "cnpg.io/hibernateClusterManifest";

/// Hibernation snapshot of `pg_controldata`. Stripped on adoption.
pub const HIBERNATE_PG_CONTROL_DATA_ANNOTATION: &str = "cnpg.io/hibernatePgControlData";

/// Annotation stamped with the operator version that last took ownership.
pub const OPERATOR_VERSION_ANNOTATION: &str = "cnpg.io/operatorVersion";

/// Kind used in owner references pointing at a cluster.
pub const CLUSTER_KIND: &str = "Cluster";

/// API version used in owner references pointing at a cluster.
pub const CLUSTER_API_VERSION: &str = "postgresql.cnpg.io/v1";

/// Name of the database container inside an instance.
pub const POSTGRES_CONTAINER_NAME: &str = "postgres";

/// Mount path of the data volume inside an instance.
pub const PG_DATA_PATH: &str = "/var/lib/postgresql/data/pgdata";

/// Default timeout for a single instance health or replication probe.
///
/// A probe that does not answer in time is treated as "not ready".
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default grace window a primary may be unready before it is declared lost.
pub const DEFAULT_PRIMARY_GRACE_SECS: u64 = 10;

/// Default outer timeout after which a stalled failover is escalated.
pub const DEFAULT_FAILOVER_TIMEOUT_SECS: u64 = 300;

/// Default interval for level-triggered periodic resync of every cluster.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// Requeue interval while waiting on a transitional phase (promotion, rejoin).
pub const TRANSITION_POLL_SECS: u64 = 2;

/// Initial retry delay after a retryable reconcile error.
pub const BACKOFF_BASE_MS: u64 = 500;

/// Upper bound for the retry delay.
pub const BACKOFF_MAX_MS: u64 = 30_000;

/// Number of re-read-and-recompute attempts on an optimistic concurrency conflict.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Default number of concurrent reconcile workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default admin HTTP port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default port of the instance manager HTTP endpoint inside each instance.
pub const DEFAULT_INSTANCE_PORT: u16 = 8000;

/// Default namespace watched by the operator.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Per-request timeout for the admin API in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default storage request for newly provisioned volumes.
pub const DEFAULT_STORAGE_SIZE: &str = "1Gi";

/// Default database image for newly provisioned instances.
pub const DEFAULT_IMAGE_NAME: &str = "ghcr.io/cloudnative-pg/postgresql:16";
