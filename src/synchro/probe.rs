//! Probe synchro
//!
//! A lightweight synchro that keeps a connection to the remote cluster alive by
//! periodically reading its server version. The version is written to storage and
//! reported on the registration together with the configured resource scope.

use super::{StatusCallback, SynchroFactory, SynchroWorker};
use crate::connection::ConnectionConfig;
use crate::crd::{
    ClusterGroupResources, ClusterGroupStatus, ClusterRegistrationStatus, ClusterResourceStatus,
};
use crate::error::{OperatorError, Result};
use crate::storage::ClusterStorage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const VERSION_RECORD: &str = "version";

/// Source of the remote API server version.
#[async_trait]
pub trait ServerVersion: Send + Sync {
    async fn server_version(&self) -> Result<String>;
}

#[async_trait]
impl ServerVersion for kube::Client {
    async fn server_version(&self) -> Result<String> {
        let info = self.apiserver_version().await?;
        Ok(info.git_version)
    }
}

/// Creates [`ProbeSynchro`] workers backed by a kube client per cluster.
pub struct ProbeSynchroFactory {
    interval: Duration,
}

impl ProbeSynchroFactory {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl SynchroFactory for ProbeSynchroFactory {
    async fn create(
        &self,
        cluster: &str,
        config: ConnectionConfig,
        storage: Arc<dyn ClusterStorage>,
        status: StatusCallback,
    ) -> Result<Arc<dyn SynchroWorker>> {
        let client = config.to_client().await.map_err(|e| {
            OperatorError::Configuration(format!("failed to build client for {}: {}", cluster, e))
        })?;
        Ok(Arc::new(ProbeSynchro::new(
            cluster,
            Arc::new(client),
            storage,
            status,
            self.interval,
        )))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ResourceScope {
    resources: Vec<ClusterGroupResources>,
    sync_all_custom_resources: bool,
}

/// Synchro worker that probes the remote server version on an interval.
pub struct ProbeSynchro {
    cluster: String,
    source: Arc<dyn ServerVersion>,
    storage: Arc<dyn ClusterStorage>,
    status: StatusCallback,
    interval: Duration,
    scope: watch::Sender<ResourceScope>,
    /// Set by shutdown; storage and status writes happen while holding it.
    closed: Mutex<bool>,
    halt: CancellationToken,
}

impl ProbeSynchro {
    pub fn new(
        cluster: &str,
        source: Arc<dyn ServerVersion>,
        storage: Arc<dyn ClusterStorage>,
        status: StatusCallback,
        interval: Duration,
    ) -> Self {
        let (scope, _) = watch::channel(ResourceScope::default());
        Self {
            cluster: cluster.to_string(),
            source,
            storage,
            status,
            interval,
            scope,
            closed: Mutex::new(false),
            halt: CancellationToken::new(),
        }
    }

    async fn probe(&self) {
        let version = match self.source.server_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(cluster = %self.cluster, "Failed to probe cluster version: {}", e);
                return;
            }
        };
        let closed = self.closed.lock().await;
        if *closed {
            return;
        }

        if let Err(e) = self
            .storage
            .upsert(&self.cluster, VERSION_RECORD, serde_json::json!(version))
            .await
        {
            warn!(cluster = %self.cluster, "Failed to store cluster version: {}", e);
        }

        let status = ClusterRegistrationStatus {
            version,
            sync_resources: scope_status(&self.scope.borrow()),
            ..Default::default()
        };
        if let Err(e) = self.status.update(status).await {
            warn!(cluster = %self.cluster, "Failed to report cluster status: {}", e);
        }
        drop(closed);
    }
}

#[async_trait]
impl SynchroWorker for ProbeSynchro {
    async fn run(&self, stop: CancellationToken) {
        info!(cluster = %self.cluster, interval = ?self.interval, "Cluster synchro started");
        let mut scope = self.scope.subscribe();
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.halt.cancelled() => break,
                _ = ticker.tick() => self.probe().await,
                changed = scope.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(cluster = %self.cluster, "Resource scope changed");
                    self.probe().await;
                }
            }
        }

        info!(cluster = %self.cluster, "Cluster synchro stopped");
    }

    async fn shutdown(&self, delete_data: bool) {
        self.halt.cancel();
        {
            // Waits out a probe that is already writing.
            let mut closed = self.closed.lock().await;
            if *closed {
                return;
            }
            *closed = true;
        }

        if delete_data {
            if let Err(e) = self.storage.clean_cluster(&self.cluster).await {
                warn!(cluster = %self.cluster, "Failed to clean synchro data: {}", e);
            }
        }
        info!(cluster = %self.cluster, delete_data, "Cluster synchro shut down");
    }

    async fn set_resources(
        &self,
        resources: Vec<ClusterGroupResources>,
        sync_all_custom_resources: bool,
    ) {
        let scope = ResourceScope {
            resources,
            sync_all_custom_resources,
        };
        self.scope.send_if_modified(|current| {
            if *current == scope {
                return false;
            }
            *current = scope;
            true
        });
    }
}

fn scope_status(scope: &ResourceScope) -> Vec<ClusterGroupStatus> {
    scope
        .resources
        .iter()
        .map(|group| ClusterGroupStatus {
            group: group.group.clone(),
            resources: group
                .resources
                .iter()
                .map(|name| ClusterResourceStatus {
                    name: name.clone(),
                    status: "Syncing".to_string(),
                    reason: None,
                })
                .collect(),
        })
        .collect()
}
