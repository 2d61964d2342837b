//! Per-cluster synchro workers
//!
//! A synchro pulls resources from one remote cluster into storage. The manager only
//! decides when a synchro exists; the traits here are the boundary it drives.

pub mod probe;

pub use probe::ProbeSynchroFactory;

use crate::connection::ConnectionConfig;
use crate::crd::{ClusterGroupResources, ClusterRegistrationStatus};
use crate::error::Result;
use crate::storage::ClusterStorage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A running synchronization worker for one cluster.
#[async_trait]
pub trait SynchroWorker: Send + Sync {
    /// Run until [`SynchroWorker::shutdown`] is called or `stop` is cancelled.
    async fn run(&self, stop: CancellationToken);

    /// Stop synchronizing. New writes are refused once this returns; with
    /// `delete_data` the cluster's stored resources are discarded as well.
    async fn shutdown(&self, delete_data: bool);

    /// Change the synchronized resource scope without restarting.
    async fn set_resources(
        &self,
        resources: Vec<ClusterGroupResources>,
        sync_all_custom_resources: bool,
    );
}

/// Builds synchro workers.
#[async_trait]
pub trait SynchroFactory: Send + Sync {
    async fn create(
        &self,
        cluster: &str,
        config: ConnectionConfig,
        storage: Arc<dyn ClusterStorage>,
        status: StatusCallback,
    ) -> Result<Arc<dyn SynchroWorker>>;
}

/// Applies partial status updates to a cluster registration.
#[async_trait]
pub trait ClusterStatusUpdater: Send + Sync {
    async fn update_cluster_status(
        &self,
        cluster: &str,
        status: ClusterRegistrationStatus,
    ) -> Result<()>;
}

/// Status updater bound to a single cluster, handed to its synchro.
#[derive(Clone)]
pub struct StatusCallback {
    cluster: String,
    updater: Arc<dyn ClusterStatusUpdater>,
}

impl StatusCallback {
    pub fn new(cluster: impl Into<String>, updater: Arc<dyn ClusterStatusUpdater>) -> Self {
        Self {
            cluster: cluster.into(),
            updater,
        }
    }

    pub async fn update(&self, status: ClusterRegistrationStatus) -> Result<()> {
        self.updater
            .update_cluster_status(&self.cluster, status)
            .await
    }
}
