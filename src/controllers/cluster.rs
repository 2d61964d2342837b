//! Cluster Synchro Reconciler
//!
//! Reconciles ClusterRegistration resources into running cluster synchros: one
//! synchro per registered cluster, rebuilt when its connection config changes and
//! torn down, with its stored data cleaned, when the registration is deleted.

use crate::conditions::{
    synchro_condition, CLUSTER_SYNCHRO_FINALIZER, CONDITION_FALSE, CONDITION_TRUE,
    REASON_INITIAL_FAILED, REASON_INVALID_CONFIG, REASON_INVALID_SYNC_RESOURCE, REASON_RUNNING,
};
use crate::connection::build_connection_config;
use crate::controllers::registry::{SynchroHandle, SynchroRegistry};
use crate::controllers::status::{ClusterStore, StatusReporter};
use crate::controllers::Reconcile;
use crate::crd::{ClusterRegistration, ClusterRegistrationStatus};
use crate::error::{OperatorError, Result};
use crate::storage::ClusterStorage;
use crate::synchro::{ClusterStatusUpdater, StatusCallback, SynchroFactory};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Reconciles cluster registrations into running synchros
pub struct ClusterSynchroReconciler {
    store: Arc<dyn ClusterStore>,
    status: Arc<StatusReporter>,
    storage: Arc<dyn ClusterStorage>,
    factory: Arc<dyn SynchroFactory>,
    registry: Arc<SynchroRegistry>,
    synchros: TaskTracker,
    stop: CancellationToken,
    allow_sync_all_resources: bool,
}

impl ClusterSynchroReconciler {
    /// Create a reconciler whose synchros stop when `stop` is cancelled.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        storage: Arc<dyn ClusterStorage>,
        factory: Arc<dyn SynchroFactory>,
        allow_sync_all_resources: bool,
        stop: CancellationToken,
    ) -> Self {
        Self {
            status: Arc::new(StatusReporter::new(store.clone())),
            store,
            storage,
            factory,
            registry: Arc::new(SynchroRegistry::new()),
            synchros: TaskTracker::new(),
            stop,
            allow_sync_all_resources,
        }
    }

    pub fn registry(&self) -> &Arc<SynchroRegistry> {
        &self.registry
    }

    /// Wait for every synchro task started by this reconciler to exit.
    pub async fn wait_synchros(&self) {
        self.synchros.close();
        self.synchros.wait().await;
    }

    /// Reconcile one cluster registration. An error means the cluster should be retried.
    pub async fn reconcile_cluster(&self, mut cluster: ClusterRegistration) -> Result<()> {
        let name = cluster.name_any();

        if cluster.is_deleting() {
            info!(cluster = %name, "Remove cluster");
            if let Err(e) = self.remove_cluster(&name).await {
                error!(cluster = %name, "Failed to remove cluster: {}", e);
                return Err(e);
            }

            if !cluster.remove_finalizer(CLUSTER_SYNCHRO_FINALIZER) {
                return Ok(());
            }
            if let Err(e) = self.store.update(&cluster).await {
                error!(cluster = %name, "Failed to remove finalizer: {}", e);
                return Err(e);
            }
            info!(cluster = %name, "Finalizer removed");
            return Ok(());
        }

        if cluster.add_finalizer(CLUSTER_SYNCHRO_FINALIZER) {
            cluster = match self.store.update(&cluster).await {
                Ok(updated) => updated,
                Err(e) => {
                    error!(cluster = %name, "Failed to add finalizer: {}", e);
                    return Err(e);
                }
            };
        }

        let config = match build_connection_config(&cluster.spec) {
            Ok(config) => config,
            Err(e) => {
                error!(cluster = %name, "Failed to build cluster config: {}", e);
                let detail = match e {
                    OperatorError::Configuration(msg) => msg,
                    other => other.to_string(),
                };
                self.update_synchro_condition(
                    &name,
                    CONDITION_FALSE,
                    REASON_INVALID_CONFIG,
                    &format!("invalid cluster config: {}", detail),
                )
                .await;
                return Ok(());
            }
        };

        // A rejected selector leaves any running synchro untouched.
        if !self.allow_sync_all_resources
            && cluster.spec.sync_resources.iter().any(|r| r.is_wildcard_group())
        {
            warn!(cluster = %name, "All-resources wildcard used without AllowSyncAllResources");
            self.update_synchro_condition(
                &name,
                CONDITION_FALSE,
                REASON_INVALID_SYNC_RESOURCE,
                "ClusterSynchro Manager's capability `AllowSyncAllResources` is not enabled, cannot use all-resources wildcard",
            )
            .await;
            return Ok(());
        }

        let mut synchro = self.registry.get(&name).await;
        if let Some(existing) = synchro.as_ref() {
            if existing.config() != &config {
                info!(cluster = %name, "Cluster config is changed, rebuild cluster synchro");
                existing.shutdown(true).await;
                self.registry.delete(&name).await;
                synchro = None;
            }
        }

        let synchro = match synchro {
            Some(synchro) => synchro,
            None => {
                let callback = StatusCallback::new(name.clone(), self.status.clone());
                let worker = match self
                    .factory
                    .create(&name, config.clone(), self.storage.clone(), callback)
                    .await
                {
                    Ok(worker) => worker,
                    Err(e) => {
                        error!(cluster = %name, "Failed to create cluster synchro: {}", e);
                        self.update_synchro_condition(
                            &name,
                            CONDITION_FALSE,
                            REASON_INITIAL_FAILED,
                            &e.to_string(),
                        )
                        .await;
                        return Err(e);
                    }
                };

                let cancel = self.stop.child_token();
                self.synchros.spawn({
                    let worker = worker.clone();
                    let cancel = cancel.clone();
                    async move { worker.run(cancel).await }
                });
                info!(cluster = %name, host = %config.host, "Cluster synchro started");
                Arc::new(SynchroHandle::new(name.clone(), config, worker, cancel))
            }
        };

        self.update_synchro_condition(&name, CONDITION_TRUE, REASON_RUNNING, "")
            .await;

        synchro
            .worker()
            .set_resources(
                cluster.spec.sync_resources.clone(),
                cluster.spec.sync_all_custom_resources,
            )
            .await;

        self.registry.set(&name, synchro).await;
        Ok(())
    }

    /// Stop the cluster's synchro, without flushing, and clean its stored data.
    async fn remove_cluster(&self, name: &str) -> Result<()> {
        if let Some(synchro) = self.registry.delete(name).await {
            synchro.shutdown(false).await;
        }
        self.storage.clean_cluster(name).await
    }

    async fn update_synchro_condition(&self, name: &str, status: &str, reason: &str, message: &str) {
        let update = ClusterRegistrationStatus {
            conditions: vec![synchro_condition(status, reason, message)],
            ..Default::default()
        };
        if let Err(e) = self.status.update_cluster_status(name, update).await {
            error!(
                cluster = %name,
                reason,
                "Failed to update cluster synchro condition: {}", e
            );
        }
    }
}

#[async_trait]
impl Reconcile for ClusterSynchroReconciler {
    async fn reconcile(&self, name: &str) -> Result<()> {
        match self.store.get(name).await? {
            Some(cluster) => self.reconcile_cluster(cluster).await,
            None => {
                info!(cluster = %name, "Cluster has been deleted");
                if self.registry.contains(name).await {
                    if let Err(e) = self.remove_cluster(name).await {
                        warn!(cluster = %name, "Failed to clean up deleted cluster: {}", e);
                    }
                }
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "cluster-synchro"
    }
}
