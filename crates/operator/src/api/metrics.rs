//! Prometheus metrics recording.

use metrics::{counter, gauge, histogram};
use pgwarden_core::ClusterPhase;
use std::time::Duration;

/// Records HTTP request metrics.
pub fn record_request(method: &str, path: &str, status: u16, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Records the outcome of one reconcile cycle.
///
/// `outcome` is `"ok"` or the [`Error::kind`](crate::error::Error::kind) label.
pub fn record_reconcile(cluster: &str, outcome: &str, duration: Duration) {
    let labels = [
        ("cluster", cluster.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("pgwarden_reconcile_total", &labels).increment(1);
    histogram!("pgwarden_reconcile_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Records a committed promotion.
pub fn record_failover(cluster: &str) {
    counter!("pgwarden_failovers_total", "cluster" => cluster.to_string()).increment(1);
}

/// Records volumes taken over by an adoption pass.
pub fn record_adoption(cluster: &str, adopted: usize) {
    counter!("pgwarden_adopted_artifacts_total", "cluster" => cluster.to_string())
        .increment(adopted as u64);
}

/// Records a newly provisioned instance.
pub fn record_instance_provisioned(cluster: &str) {
    counter!("pgwarden_instances_provisioned_total", "cluster" => cluster.to_string())
        .increment(1);
}

/// Exposes the current phase as a one-hot gauge family.
pub fn update_cluster_phase(cluster: &str, phase: ClusterPhase) {
    use ClusterPhase::*;
    for candidate in [Bootstrapping, Healthy, PrimaryLost, Electing, Promoting, Rejoining] {
        let value = if candidate == phase { 1.0 } else { 0.0 };
        gauge!(
            "pgwarden_cluster_phase",
            "cluster" => cluster.to_string(),
            "phase" => candidate.as_str()
        )
        .set(value);
    }
}

/// Updates the `pgwarden_queue_depth` gauge.
pub fn update_queue_depth(depth: usize) {
    gauge!("pgwarden_queue_depth").set(depth as f64);
}
