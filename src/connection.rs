//! Connection configuration derived from a ClusterRegistration
//!
//! [`build_connection_config`] is a pure function: it validates and normalizes the
//! credential fields of a registration without touching the network. Two
//! registrations that produce equal [`ConnectionConfig`] values share a synchro;
//! any difference forces the synchro to be rebuilt.

use crate::crd::ClusterRegistrationSpec;
use crate::error::{OperatorError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

const CONTEXT_NAME: &str = "synchro";

/// Snapshot of everything needed to connect to a remote API server.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ConnectionConfig {
    pub host: String,
    pub ca_data: Option<Vec<u8>>,
    pub insecure: bool,
    pub cert_data: Option<Vec<u8>>,
    pub key_data: Option<Vec<u8>>,
    pub bearer_token: Option<String>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("ca_data", &self.ca_data.as_ref().map(|_| "<redacted>"))
            .field("insecure", &self.insecure)
            .field("cert_data", &self.cert_data.as_ref().map(|_| "<redacted>"))
            .field("key_data", &self.key_data.as_ref().map(|_| "<redacted>"))
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConnectionConfig {
    /// Render the config as a single-context kubeconfig document.
    pub fn to_kubeconfig_yaml(&self) -> Result<String> {
        let kubeconfig = KubeconfigFile {
            clusters: vec![NamedCluster {
                name: CONTEXT_NAME.to_string(),
                cluster: KubeconfigCluster {
                    server: self.host.clone(),
                    certificate_authority_data: self.ca_data.as_ref().map(|d| STANDARD.encode(d)),
                    insecure_skip_tls_verify: self.insecure,
                },
            }],
            users: vec![NamedUser {
                name: CONTEXT_NAME.to_string(),
                user: KubeconfigUser {
                    client_certificate_data: self.cert_data.as_ref().map(|d| STANDARD.encode(d)),
                    client_key_data: self.key_data.as_ref().map(|d| STANDARD.encode(d)),
                    token: self.bearer_token.clone(),
                },
            }],
            contexts: vec![NamedContext {
                name: CONTEXT_NAME.to_string(),
                context: KubeconfigContext {
                    cluster: CONTEXT_NAME.to_string(),
                    user: CONTEXT_NAME.to_string(),
                },
            }],
            current_context: CONTEXT_NAME.to_string(),
        };
        Ok(serde_yaml::to_string(&kubeconfig)?)
    }

    /// Build a kube client for the remote cluster.
    pub async fn to_client(&self) -> Result<kube::Client> {
        let yaml = self.to_kubeconfig_yaml()?;
        let kubeconfig = kube::config::Kubeconfig::from_yaml(&yaml)
            .map_err(|e| OperatorError::Configuration(e.to_string()))?;
        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await
        .map_err(|e| OperatorError::Configuration(e.to_string()))?;
        kube::Client::try_from(config).map_err(OperatorError::from)
    }
}

/// Derive the connection config for a registration.
pub fn build_connection_config(spec: &ClusterRegistrationSpec) -> Result<ConnectionConfig> {
    if let Some(kubeconfig) = spec.kubeconfig.as_ref().filter(|k| !k.0.is_empty()) {
        return parse_kubeconfig(&kubeconfig.0);
    }

    if spec.apiserver.is_empty() {
        return Err(OperatorError::Configuration(
            "Cluster APIServer Endpoint is required".to_string(),
        ));
    }

    let token = non_empty(&spec.token_data);
    let cert = non_empty(&spec.cert_data);
    let key = non_empty(&spec.key_data);

    if token.is_none() && (cert.is_none() || key.is_none()) {
        return Err(OperatorError::Configuration(
            "Cluster APIServer's Token or Cert is required".to_string(),
        ));
    }

    let mut config = ConnectionConfig {
        host: spec.apiserver.clone(),
        ..Default::default()
    };

    match non_empty(&spec.ca_data) {
        Some(ca) => config.ca_data = Some(ca.to_vec()),
        None => config.insecure = true,
    }

    if let (Some(cert), Some(key)) = (cert, key) {
        config.cert_data = Some(cert.to_vec());
        config.key_data = Some(key.to_vec());
    }

    if let Some(token) = token {
        config.bearer_token = Some(String::from_utf8_lossy(token).into_owned());
    }

    Ok(config)
}

fn non_empty(field: &Option<k8s_openapi::ByteString>) -> Option<&[u8]> {
    field
        .as_ref()
        .map(|b| b.0.as_slice())
        .filter(|b| !b.is_empty())
}

fn parse_kubeconfig(data: &[u8]) -> Result<ConnectionConfig> {
    let kubeconfig: KubeconfigFile = serde_yaml::from_slice(data)
        .map_err(|e| OperatorError::Configuration(format!("invalid kubeconfig: {}", e)))?;

    let context = if kubeconfig.current_context.is_empty() {
        match kubeconfig.contexts.as_slice() {
            [only] => only,
            _ => {
                return Err(OperatorError::Configuration(
                    "kubeconfig has no current-context".to_string(),
                ))
            }
        }
    } else {
        kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == kubeconfig.current_context)
            .ok_or_else(|| {
                OperatorError::Configuration(format!(
                    "context {:?} not found in kubeconfig",
                    kubeconfig.current_context
                ))
            })?
    };

    let cluster = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == context.context.cluster)
        .map(|c| &c.cluster)
        .ok_or_else(|| {
            OperatorError::Configuration(format!(
                "cluster {:?} not found in kubeconfig",
                context.context.cluster
            ))
        })?;

    if cluster.server.is_empty() {
        return Err(OperatorError::Configuration(
            "kubeconfig cluster has no server".to_string(),
        ));
    }

    let user = if context.context.user.is_empty() {
        KubeconfigUser::default()
    } else {
        kubeconfig
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .map(|u| u.user.clone())
            .ok_or_else(|| {
                OperatorError::Configuration(format!(
                    "user {:?} not found in kubeconfig",
                    context.context.user
                ))
            })?
    };

    let config = ConnectionConfig {
        host: cluster.server.clone(),
        ca_data: decode_field("certificate-authority-data", &cluster.certificate_authority_data)?,
        insecure: cluster.insecure_skip_tls_verify,
        cert_data: decode_field("client-certificate-data", &user.client_certificate_data)?,
        key_data: decode_field("client-key-data", &user.client_key_data)?,
        bearer_token: user.token.filter(|t| !t.is_empty()),
    };

    let has_cert_pair = config.cert_data.is_some() && config.key_data.is_some();
    if config.bearer_token.is_none() && !has_cert_pair {
        return Err(OperatorError::Configuration(
            "kubeconfig user has no token or client certificate".to_string(),
        ));
    }
    Ok(config)
}

fn decode_field(field: &str, value: &Option<String>) -> Result<Option<Vec<u8>>> {
    match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| OperatorError::Configuration(format!("invalid {}: {}", field, e))),
        None => Ok(None),
    }
}

// Subset of the kubeconfig format that carries inline credentials.

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigFile {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    current_context: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    #[serde(default)]
    cluster: KubeconfigCluster,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigCluster {
    #[serde(default)]
    server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: KubeconfigUser,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_certificate_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_key_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: KubeconfigContext,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KubeconfigContext {
    cluster: String,
    #[serde(default)]
    user: String,
}
