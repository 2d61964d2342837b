//! Kubernetes Lease-based leader election for HA manager deployments.
//!
//! Only the replica holding the Lease runs the cluster synchro manager. Standby
//! replicas wait in [`LeaderElector::acquire`] until the holder's lease expires or is
//! released; the leader cancels its stop token as soon as a renewal fails.

use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_LEASE_NAME: &str = "cluster-synchro-manager-leader";

/// Lease timing and identity.
#[derive(Clone, Debug)]
pub struct LeaseSettings {
    pub name: String,
    pub duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_LEASE_NAME.to_string(),
            duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Detects the namespace for leader election.
///
/// Priority: explicit argument, then the service account file, then `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

#[derive(Debug, PartialEq, Eq)]
enum Claim {
    /// We hold it already.
    Renew,
    /// Unheld or expired.
    Takeover,
    /// Someone else holds a live lease.
    Wait,
}

fn claim(spec: Option<&LeaseSpec>, identity: &str, default_secs: i32, now: DateTime<Utc>) -> Claim {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return Claim::Renew;
    }
    if holder.is_none() {
        return Claim::Takeover;
    }

    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(default_secs) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(renewed)) if now.signed_duration_since(*renewed).num_seconds() <= duration => {
            Claim::Wait
        }
        _ => Claim::Takeover,
    }
}

/// Lease-based leader elector.
///
/// All writes carry the Lease's `resourceVersion`; losing a write race is treated as
/// not holding the lease.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
    settings: LeaseSettings,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, settings: LeaseSettings) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("cluster-synchro-manager-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, lease = %settings.name, "Initialized leader elector");
        Self {
            lease_api,
            identity,
            settings,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Wait until the lease is ours. Returns `false` if `stop` fired first.
    pub async fn acquire(&self, stop: &CancellationToken) -> bool {
        info!(identity = %self.identity, "Waiting to acquire leader lease '{}'", self.settings.name);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return true;
                }
                Ok(false) => debug!("Lease held by another instance"),
                Err(e) => warn!("Lease acquisition error: {}", e),
            }
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(self.settings.retry_interval) => {}
            }
        }
    }

    /// Renew the lease until it is lost or `stop` fires. Losing the lease cancels `stop`.
    pub async fn hold(&self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.settings.renew_interval) => {}
            }
            match self.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    error!("Lost leader lease, stopping");
                    stop.cancel();
                    return;
                }
                Err(e) => {
                    error!("Failed to renew leader lease, stopping: {}", e);
                    stop.cancel();
                    return;
                }
            }
        }
    }

    /// Renews the lease. Returns `Ok(true)` if still leader, `Ok(false)` if lost.
    pub async fn renew(&self) -> Result<bool> {
        let lease = self.lease_api.get(&self.settings.name).await?;
        if claim(lease.spec.as_ref(), &self.identity, self.lease_secs(), Utc::now()) != Claim::Renew {
            return Ok(false);
        }
        let renewed = self.write(&lease, MicroTime(Utc::now()), false).await?;
        if renewed {
            debug!("Renewed leader lease");
        } else {
            warn!("Lease conflict during renewal, lost leadership");
        }
        Ok(renewed)
    }

    /// Releases the lease by clearing the holder identity.
    pub async fn release(&self) {
        let lease = match self.lease_api.get(&self.settings.name).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };
        if claim(lease.spec.as_ref(), &self.identity, self.lease_secs(), Utc::now()) != Claim::Renew {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut released = lease;
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(&self.settings.name, &PostParams::default(), &released)
            .await
        {
            Ok(_) => info!(identity = %self.identity, "Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    fn lease_secs(&self) -> i32 {
        i32::try_from(self.settings.duration.as_secs()).unwrap_or(i32::MAX)
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        match self.lease_api.get(&self.settings.name).await {
            Ok(existing) => {
                match claim(existing.spec.as_ref(), &self.identity, self.lease_secs(), now.0) {
                    Claim::Renew => self.write(&existing, now, false).await,
                    Claim::Takeover => self.write(&existing, now, true).await,
                    Claim::Wait => Ok(false),
                }
            }
            Err(e) => match OperatorError::from(e) {
                OperatorError::NotFound(_) => self.create(now).await,
                other => Err(other),
            },
        }
    }

    async fn create(&self, now: MicroTime) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.settings.name.clone()),
                ..Default::default()
            },
            spec: Some(self.held_spec(None, now, true)),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) => match OperatorError::from(e) {
                OperatorError::Conflict(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn write(&self, existing: &Lease, now: MicroTime, takeover: bool) -> Result<bool> {
        let mut updated = existing.clone();
        updated.spec = Some(self.held_spec(existing.spec.as_ref(), now, takeover));
        match self
            .lease_api
            .replace(&self.settings.name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match OperatorError::from(e) {
                OperatorError::Conflict(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    fn held_spec(&self, prev: Option<&LeaseSpec>, now: MicroTime, takeover: bool) -> LeaseSpec {
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_secs()),
            acquire_time: if takeover {
                Some(now.clone())
            } else {
                prev.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(now),
            lease_transitions: Some(match (takeover, prev) {
                (true, Some(_)) => transitions + 1,
                _ => transitions,
            }),
            ..Default::default()
        }
    }
}
