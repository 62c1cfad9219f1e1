//! Health and control channel to the instance manager running next to each
//! database process.
//!
//! The reconciler never talks to PostgreSQL directly. Each instance exposes a
//! small HTTP endpoint on the instance manager port:
//!
//! - `GET /pg/status` reports whether the engine is primary or in recovery and
//!   its received/replayed WAL positions.
//! - `POST /pg/promote` ends recovery. Idempotent.
//! - `POST /pg/demote` restarts the engine as a standby following `primary`.

use async_trait::async_trait;
use pgwarden_core::{Instance, Lsn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Replication state reported by one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub is_primary: bool,
    pub in_recovery: bool,
    #[serde(default)]
    pub received_lsn: Option<Lsn>,
    #[serde(default)]
    pub replay_lsn: Option<Lsn>,
}

impl InstanceStatus {
    /// Most advanced WAL position known to the instance, used for election.
    pub fn position(&self) -> Lsn {
        self.received_lsn
            .into_iter()
            .chain(self.replay_lsn)
            .max()
            .unwrap_or(Lsn::ZERO)
    }
}

#[derive(Debug, Serialize)]
struct DemoteRequest<'a> {
    primary: &'a str,
}

/// Control-plane client for instance managers.
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Probes the instance. Fails with `NotReady` if it cannot answer.
    async fn status(&self, instance: &Instance) -> Result<InstanceStatus>;

    /// Ends recovery on `instance`. Promoting a primary is a no-op.
    async fn promote(&self, instance: &Instance) -> Result<()>;

    /// Turns `instance` into a standby streaming from `primary`.
    async fn demote(&self, instance: &Instance, primary: &str) -> Result<()>;
}

/// One instance together with what its probe reported this cycle.
#[derive(Debug, Clone)]
pub struct Observed {
    pub instance: Instance,
    /// `None` when the probe failed or timed out.
    pub status: Option<InstanceStatus>,
}

impl Observed {
    /// Platform-ready and answering probes.
    pub fn is_healthy(&self) -> bool {
        self.instance.ready && self.status.is_some()
    }

    /// Healthy and serving writes.
    pub fn is_serving_primary(&self) -> bool {
        self.is_healthy()
            && self
                .status
                .map(|s| s.is_primary && !s.in_recovery)
                .unwrap_or(false)
    }

    /// Healthy and replaying WAL from a primary.
    pub fn is_streaming_standby(&self) -> bool {
        self.is_healthy() && self.status.map(|s| s.in_recovery).unwrap_or(false)
    }

    /// Reports itself primary, whatever its platform readiness.
    pub fn claims_primary(&self) -> bool {
        self.status
            .map(|s| s.is_primary && !s.in_recovery)
            .unwrap_or(false)
    }
}

/// Probes every instance concurrently, each bounded by `timeout`.
pub async fn observe_all(
    client: &dyn InstanceClient,
    instances: Vec<Instance>,
    timeout: Duration,
) -> Vec<Observed> {
    let probes = instances.into_iter().map(|instance| async move {
        let status = match probe_with_timeout(&instance.name, timeout, client.status(&instance))
            .await
        {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::debug!(instance = %instance.name, error = %e, "Probe failed");
                None
            }
        };
        Observed { instance, status }
    });
    futures::future::join_all(probes).await
}

/// Runs `probe`, mapping a timeout to `NotReady` for `instance`.
pub async fn probe_with_timeout<F, T>(instance: &str, timeout: Duration, probe: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, probe).await {
        Ok(result) => result,
        Err(_) => Err(Error::not_ready(
            instance,
            format!("no answer within {}ms", timeout.as_millis()),
        )),
    }
}

/// [`InstanceClient`] speaking HTTP to the instance manager.
#[derive(Clone)]
pub struct HttpInstanceClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpInstanceClient {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::store_with_source("building instance http client", e))?;
        Ok(Self { client, port })
    }

    fn url(&self, instance: &Instance, path: &str) -> Result<String> {
        let address = instance
            .address
            .as_deref()
            .ok_or_else(|| Error::not_ready(&instance.name, "no address assigned"))?;
        Ok(format!("http://{}:{}{}", address, self.port, path))
    }

    fn transport_error(instance: &Instance, e: reqwest::Error) -> Error {
        if e.is_timeout() || e.is_connect() {
            Error::not_ready(&instance.name, e.to_string())
        } else {
            Error::Instance {
                instance: instance.name.clone(),
                message: e.to_string(),
            }
        }
    }

    fn check_status(instance: &Instance, resp: &reqwest::Response) -> Result<()> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Instance {
                instance: instance.name.clone(),
                message: format!("instance manager answered {}", resp.status()),
            })
        }
    }
}

#[async_trait]
impl InstanceClient for HttpInstanceClient {
    async fn status(&self, instance: &Instance) -> Result<InstanceStatus> {
        let url = self.url(instance, "/pg/status")?;
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(instance, e))?;
        if !resp.status().is_success() {
            return Err(Error::not_ready(
                &instance.name,
                format!("status endpoint answered {}", resp.status()),
            ));
        }
        resp.json()
            .await
            .map_err(|e| Self::transport_error(instance, e))
    }

    async fn promote(&self, instance: &Instance) -> Result<()> {
        let url = self.url(instance, "/pg/promote")?;
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(instance, e))?;
        Self::check_status(instance, &resp)
    }

    async fn demote(&self, instance: &Instance, primary: &str) -> Result<()> {
        let url = self.url(instance, "/pg/demote")?;
        let resp = self
            .client
            .post(&url)
            .json(&DemoteRequest { primary })
            .send()
            .await
            .map_err(|e| Self::transport_error(instance, e))?;
        Self::check_status(instance, &resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let status: InstanceStatus = serde_json::from_str(
            r#"{"isPrimary":false,"inRecovery":true,"receivedLsn":"0/3000060","replayLsn":"0/3000028"}"#,
        )
        .unwrap();
        assert!(status.in_recovery);
        assert_eq!(status.position(), "0/3000060".parse().unwrap());
    }

    #[test]
    fn test_primary_without_positions() {
        let status: InstanceStatus =
            serde_json::from_str(r#"{"isPrimary":true,"inRecovery":false}"#).unwrap();
        assert_eq!(status.position(), Lsn::ZERO);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_not_ready() {
        let err = probe_with_timeout("pg-1", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_missing_address_is_not_ready() {
        let client = HttpInstanceClient::new(8000, Duration::from_secs(1)).unwrap();
        let cluster = pgwarden_core::Cluster::new("pg", Default::default());
        let instance =
            Instance::for_cluster(&cluster, 1, pgwarden_core::InstanceRole::Primary);
        let err = client.status(&instance).await.unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }
}
