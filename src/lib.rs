//! Cluster Synchro Manager
//!
//! A Kubernetes controller that keeps exactly one synchronization worker running for
//! every registered remote cluster.
//!
//! ## Custom Resources
//!
//! - `ClusterRegistration`: how to reach a remote cluster and which resources to sync
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: synchro.io/v1alpha1
//! kind: ClusterRegistration
//! metadata:
//!   name: east
//! spec:
//!   apiserver: https://east.example.com:6443
//!   tokenData: dG9rZW4=
//!   syncResources:
//!     - group: apps
//!       resources: ["deployments"]
//! ```

pub mod conditions;
pub mod connection;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod storage;
pub mod synchro;

pub use connection::{build_connection_config, ConnectionConfig};
pub use controllers::{ClusterSynchroManager, ClusterSynchroReconciler, ManagerSettings};
pub use crd::{
    ClusterCondition, ClusterGroupResources, ClusterGroupStatus, ClusterRegistration,
    ClusterRegistrationSpec, ClusterRegistrationStatus, ClusterResourceStatus,
};
pub use error::{OperatorError, Result};
pub use storage::{ClusterStorage, MemoryStorage};
pub use synchro::{ProbeSynchroFactory, StatusCallback, SynchroFactory, SynchroWorker};
