//! Resource storage boundary
//!
//! The manager only needs storage to forget everything it holds for a cluster once
//! that cluster is unregistered. [`MemoryStorage`] keeps records in process and is
//! what the binary runs with.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Storage for resources synchronized from remote clusters.
#[async_trait]
pub trait ClusterStorage: Send + Sync {
    /// Remove every resource stored for `cluster`.
    ///
    /// Must succeed on a cluster that is already clean or was never populated.
    async fn clean_cluster(&self, cluster: &str) -> Result<()>;

    /// Insert or replace a record for `cluster`.
    async fn upsert(&self, cluster: &str, key: &str, value: serde_json::Value) -> Result<()>;
}

/// In-memory storage keyed by cluster name, then record key.
#[derive(Default)]
pub struct MemoryStorage {
    clusters: RwLock<HashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, cluster: &str, key: &str) -> Option<serde_json::Value> {
        let clusters = self.clusters.read().await;
        clusters.get(cluster).and_then(|records| records.get(key).cloned())
    }

    /// Number of records held for `cluster`.
    pub async fn record_count(&self, cluster: &str) -> usize {
        let clusters = self.clusters.read().await;
        clusters.get(cluster).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl ClusterStorage for MemoryStorage {
    async fn clean_cluster(&self, cluster: &str) -> Result<()> {
        let removed = self.clusters.write().await.remove(cluster);
        debug!(
            cluster = %cluster,
            records = removed.map_or(0, |r| r.len()),
            "Cleaned cluster storage"
        );
        Ok(())
    }

    async fn upsert(&self, cluster: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut clusters = self.clusters.write().await;
        clusters
            .entry(cluster.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }
}
