//! Registry of running cluster synchros

use crate::connection::ConnectionConfig;
use crate::synchro::SynchroWorker;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A synchro worker started for one cluster and the config it was built with.
pub struct SynchroHandle {
    cluster: String,
    config: ConnectionConfig,
    worker: Arc<dyn SynchroWorker>,
    cancel: CancellationToken,
}

impl SynchroHandle {
    pub fn new(
        cluster: impl Into<String>,
        config: ConnectionConfig,
        worker: Arc<dyn SynchroWorker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            config,
            worker,
            cancel,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn worker(&self) -> &Arc<dyn SynchroWorker> {
        &self.worker
    }

    /// Shut the worker down and cancel its run task.
    pub async fn shutdown(&self, delete_data: bool) {
        debug!(cluster = %self.cluster, delete_data, "Shutting down cluster synchro");
        self.worker.shutdown(delete_data).await;
        self.cancel.cancel();
    }
}

/// Concurrent map of cluster name to its synchro.
#[derive(Default)]
pub struct SynchroRegistry {
    synchros: RwLock<HashMap<String, Arc<SynchroHandle>>>,
}

impl SynchroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, cluster: &str) -> Option<Arc<SynchroHandle>> {
        self.synchros.read().await.get(cluster).cloned()
    }

    pub async fn set(&self, cluster: &str, handle: Arc<SynchroHandle>) {
        self.synchros
            .write()
            .await
            .insert(cluster.to_string(), handle);
    }

    /// Remove and return the synchro for `cluster`.
    pub async fn delete(&self, cluster: &str) -> Option<Arc<SynchroHandle>> {
        self.synchros.write().await.remove(cluster)
    }

    pub async fn contains(&self, cluster: &str) -> bool {
        self.synchros.read().await.contains_key(cluster)
    }

    pub async fn len(&self) -> usize {
        self.synchros.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.synchros.read().await.is_empty()
    }

    /// Names of all registered clusters, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.synchros.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterGroupResources;
    use async_trait::async_trait;

    struct IdleWorker;

    #[async_trait]
    impl SynchroWorker for IdleWorker {
        async fn run(&self, stop: CancellationToken) {
            stop.cancelled().await;
        }
        async fn shutdown(&self, _delete_data: bool) {}
        async fn set_resources(&self, _resources: Vec<ClusterGroupResources>, _all: bool) {}
    }

    fn handle(cluster: &str, host: &str) -> Arc<SynchroHandle> {
        let config = ConnectionConfig {
            host: host.to_string(),
            ..Default::default()
        };
        Arc::new(SynchroHandle::new(
            cluster,
            config,
            Arc::new(IdleWorker),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let registry = SynchroRegistry::new();
        assert!(registry.get("east").await.is_none());

        registry.set("east", handle("east", "https://east")).await;
        assert!(registry.contains("east").await);
        assert_eq!(
            registry.get("east").await.unwrap().config().host,
            "https://east"
        );

        let removed = registry.delete("east").await.unwrap();
        assert_eq!(removed.config().host, "https://east");
        assert!(registry.is_empty().await);
        assert!(registry.delete("east").await.is_none());
    }

    #[tokio::test]
    async fn test_set_replaces_existing_entry() {
        let registry = SynchroRegistry::new();
        registry.set("east", handle("east", "https://a")).await;
        registry.set("east", handle("east", "https://b")).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("east").await.unwrap().config().host, "https://b");
    }

    #[tokio::test]
    async fn test_names_sorted() {
        let registry = SynchroRegistry::new();
        registry.set("west", handle("west", "https://w")).await;
        registry.set("east", handle("east", "https://e")).await;
        assert_eq!(registry.names().await, vec!["east", "west"]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_run_token() {
        let token = CancellationToken::new();
        let handle = SynchroHandle::new(
            "east",
            ConnectionConfig::default(),
            Arc::new(IdleWorker),
            token.clone(),
        );
        handle.shutdown(false).await;
        assert!(token.is_cancelled());
    }
}
