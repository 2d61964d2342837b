//! Custom Resource Definitions for the Cluster Synchro Manager
//!
//! - ClusterRegistration: a remote cluster to synchronize and its reported state

mod cluster;

pub use cluster::{
    ClusterCondition, ClusterGroupResources, ClusterGroupStatus, ClusterRegistration,
    ClusterRegistrationSpec, ClusterRegistrationStatus, ClusterResourceStatus, WILDCARD_GROUP,
};
