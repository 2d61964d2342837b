//! Controllers for the Cluster Synchro Manager
//!
//! The manager runs a kube `Controller` over ClusterRegistration resources; the
//! reconciler turns each name into a running, rebuilt or removed cluster synchro.

mod cluster;
mod manager;
mod registry;
mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::ClusterSynchroReconciler;
pub use manager::{
    spec_changes, ClusterSynchroManager, Context, ManagerSettings, RetryPolicy,
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, MAX_CLUSTER_SYNCHRO_RETRY,
};
pub use registry::{SynchroHandle, SynchroRegistry};
pub use status::{merge_status, ClusterStore, KubeClusterStore, StatusReporter};

use crate::error::OperatorError;

/// Reconciles one object by name
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    /// Bring the named object's synchro in line with its desired state. An error
    /// requeues the name with backoff.
    async fn reconcile(&self, name: &str) -> Result<(), OperatorError>;

    /// Get the controller name for logging
    fn name(&self) -> &'static str;
}
