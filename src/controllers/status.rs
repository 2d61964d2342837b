//! Cluster registration access and status reporting
//!
//! Reads come from the informer cache; writes go to the API server with the
//! object's `resourceVersion`, so concurrent writers surface as conflicts instead
//! of overwriting each other.

use crate::conditions::set_condition;
use crate::crd::{ClusterRegistration, ClusterRegistrationStatus};
use crate::error::{OperatorError, Result};
use crate::synchro::ClusterStatusUpdater;
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Attempts made by [`StatusReporter`] before giving up on conflicts.
pub const STATUS_UPDATE_ATTEMPTS: usize = 5;
const STATUS_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Access to ClusterRegistration objects.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Cached copy of the registration, `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<ClusterRegistration>>;

    /// Replace the object's metadata and spec.
    async fn update(&self, cluster: &ClusterRegistration) -> Result<ClusterRegistration>;

    /// Replace the object's status subresource.
    async fn update_status(&self, cluster: &ClusterRegistration) -> Result<ClusterRegistration>;
}

/// [`ClusterStore`] backed by a reflector cache and the Kubernetes API.
pub struct KubeClusterStore {
    api: Api<ClusterRegistration>,
    cache: Store<ClusterRegistration>,
}

impl KubeClusterStore {
    pub fn new(api: Api<ClusterRegistration>, cache: Store<ClusterRegistration>) -> Self {
        Self { api, cache }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, name: &str) -> Result<Option<ClusterRegistration>> {
        Ok(self
            .cache
            .get(&ObjectRef::new(name))
            .map(|cluster| cluster.as_ref().clone()))
    }

    async fn update(&self, cluster: &ClusterRegistration) -> Result<ClusterRegistration> {
        Ok(self
            .api
            .replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await?)
    }

    async fn update_status(&self, cluster: &ClusterRegistration) -> Result<ClusterRegistration> {
        let data = serde_json::to_vec(cluster)?;
        Ok(self
            .api
            .replace_status(&cluster.name_any(), &PostParams::default(), data)
            .await?)
    }
}

/// Merges partial status updates into ClusterRegistration objects.
pub struct StatusReporter {
    store: Arc<dyn ClusterStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    async fn try_update(&self, name: &str, partial: &ClusterRegistrationStatus) -> Result<()> {
        let mut cluster = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| OperatorError::NotFound(format!("cluster {}", name)))?;

        let last = cluster.status.clone().unwrap_or_default();
        let merged = merge_status(&last, partial);
        if merged == last {
            return Ok(());
        }

        cluster.status = Some(merged);
        self.store.update_status(&cluster).await?;
        debug!(cluster = %name, conditions = ?partial.conditions, "Updated cluster status");
        Ok(())
    }
}

#[async_trait]
impl ClusterStatusUpdater for StatusReporter {
    async fn update_cluster_status(
        &self,
        cluster: &str,
        status: ClusterRegistrationStatus,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.try_update(cluster, &status).await {
                Err(e) if e.is_conflict() && attempt < STATUS_UPDATE_ATTEMPTS => {
                    debug!(cluster = %cluster, attempt, "Status update conflict, retrying");
                    attempt += 1;
                    tokio::time::sleep(STATUS_RETRY_INTERVAL).await;
                }
                result => return result,
            }
        }
    }
}

/// Merge `partial` into `current`.
///
/// Version and synced resources are taken from `partial` when non-empty; conditions
/// are merged by type with [`set_condition`].
pub fn merge_status(
    current: &ClusterRegistrationStatus,
    partial: &ClusterRegistrationStatus,
) -> ClusterRegistrationStatus {
    let mut merged = current.clone();
    if !partial.version.is_empty() {
        merged.version = partial.version.clone();
    }
    if !partial.sync_resources.is_empty() {
        merged.sync_resources = partial.sync_resources.clone();
    }
    for condition in &partial.conditions {
        set_condition(&mut merged.conditions, condition.clone());
    }
    merged
}
