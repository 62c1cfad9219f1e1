//! HTTP request handlers and application state.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

use super::errors::ApiError;
use super::models::*;
use crate::scheduler::WorkQueue;
use crate::store::ObjectStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub queue: Arc<WorkQueue>,
    pub prometheus_handle: PrometheusHandle,
    pub start_time: Instant,
}

fn validate_cluster_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "Invalid cluster name '{name}': must be a DNS-1123 label"
        )))
    }
}

/// `GET /health`: liveness plus a few counters.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let clusters = state.store.list_clusters().await;
    let (status, text, count) = match clusters {
        Ok(clusters) => (StatusCode::OK, "ok", clusters.len()),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not list clusters");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", 0)
        }
    };
    (
        status,
        Json(HealthResponse {
            status: text.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            clusters_count: count,
            queue_depth: state.queue.len(),
        }),
    )
}

/// `GET /metrics`: Prometheus exposition.
pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// `GET /clusters`
pub async fn list_clusters(
    State(state): State<AppState>,
) -> Result<Json<ListClustersResponse>, ApiError> {
    let clusters = state.store.list_clusters().await?;
    Ok(Json(ListClustersResponse {
        clusters: clusters.iter().map(ClusterSummary::from).collect(),
    }))
}

/// `GET /clusters/:name`
pub async fn get_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ClusterDetail>, ApiError> {
    validate_cluster_name(&name)?;
    let cluster = state
        .store
        .get_cluster(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Cluster '{name}' not found")))?;
    let mut members = state.store.list_instances(&name).await?;
    members.sort_by_key(|i| i.serial);
    Ok(Json(ClusterDetail {
        name: cluster.name().to_string(),
        instances: cluster.spec.instances,
        members: members.iter().map(InstanceInfo::from).collect(),
        status: cluster.status,
    }))
}

/// `POST /clusters/:name/reconcile`: queue an immediate reconcile.
pub async fn trigger_reconcile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<ReconcileQueuedResponse>), ApiError> {
    validate_cluster_name(&name)?;
    if state.store.get_cluster(&name).await?.is_none() {
        return Err(ApiError::NotFound(format!("Cluster '{name}' not found")));
    }
    state.queue.add(&name);
    tracing::info!(cluster = %name, "Reconcile requested via API");
    Ok((
        StatusCode::ACCEPTED,
        Json(ReconcileQueuedResponse {
            cluster: name,
            queued: true,
        }),
    ))
}
