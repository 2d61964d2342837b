//! Error types for the Cluster Synchro Manager

use thiserror::Error;

/// Result type alias for manager operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while managing cluster synchros
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),
    /// Optimistic concurrency conflict on write
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// Invalid cluster connection configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Resource storage error
    #[error("Storage error: {0}")]
    Storage(String),
    /// Invalid manager state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl OperatorError {
    /// Whether the error is a write conflict that is worth re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound(_))
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message),
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message),
            other => OperatorError::KubeApi(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}
