//! ClusterRegistration Custom Resource Definition
//!
//! Describes one remote Kubernetes cluster to synchronize: how to connect to it,
//! which resources to pull, and the status reported back by the manager.

use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Group name that selects every API group.
pub const WILDCARD_GROUP: &str = "*";

/// ClusterRegistration is the Schema for the clusterregistrations API
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "synchro.io",
    version = "v1alpha1",
    kind = "ClusterRegistration",
    status = "ClusterRegistrationStatus",
    shortname = "creg",
    printcolumn = r#"{"name":"APIServer","type":"string","jsonPath":".spec.apiserver"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"ClusterSynchro\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationSpec {
    /// Complete kubeconfig document; takes precedence over the discrete fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub kubeconfig: Option<ByteString>,

    /// API server endpoint of the remote cluster
    #[serde(default)]
    pub apiserver: String,

    /// PEM encoded CA bundle used to verify the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca_data: Option<ByteString>,

    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub token_data: Option<ByteString>,

    /// PEM encoded client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub cert_data: Option<ByteString>,

    /// PEM encoded client key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub key_data: Option<ByteString>,

    /// Resources to synchronize from the remote cluster
    #[serde(default)]
    pub sync_resources: Vec<ClusterGroupResources>,

    /// Synchronize every custom resource served by the remote cluster
    #[serde(default)]
    pub sync_all_custom_resources: bool,
}

/// Resources selected within one API group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupResources {
    /// API group, `*` selects all groups
    pub group: String,

    /// Resource names within the group, `*` selects all of them
    #[serde(default)]
    pub resources: Vec<String>,
}

impl ClusterGroupResources {
    pub fn is_wildcard_group(&self) -> bool {
        self.group == WILDCARD_GROUP
    }
}

/// Status of the ClusterRegistration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationStatus {
    /// Version reported by the remote API server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Resources currently synchronized, per group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_resources: Vec<ClusterGroupStatus>,

    /// Conditions representing synchro state
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

/// Synchronization state of one API group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupStatus {
    pub group: String,

    #[serde(default)]
    pub resources: Vec<ClusterResourceStatus>,
}

/// Synchronization state of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceStatus {
    /// Plural resource name
    pub name: String,

    /// Synchro state, e.g. Pending or Syncing
    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Condition of the cluster registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl ClusterRegistration {
    /// Whether the user has requested deletion.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|f| f == finalizer)
    }

    /// Adds `finalizer`, returning false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        true
    }

    /// Removes `finalizer`, returning false if it was absent.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        before != finalizers.len()
    }
}
