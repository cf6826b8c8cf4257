//! Cluster access
//!
//! The control loop talks to the cluster only through [`ClusterClient`],
//! which keeps the decision and actuation logic testable against an
//! in-memory cluster. [`KubeCluster`] is the production implementation.

mod kubernetes;
pub mod quantity;
pub mod selector;

#[cfg(test)]
pub(crate) mod memory;

pub use kubernetes::KubeCluster;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use thiserror::Error;

/// Normalised failure of a single cluster API call
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("resource not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    /// Conflicts, throttling, server-side and transport failures may clear up on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::Conflict(_) | ClusterError::Transport(_) => true,
            ClusterError::Api { code, .. } => *code == 429 || *code >= 500,
            ClusterError::NotFound | ClusterError::Serialization(_) => false,
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound,
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message),
            kube::Error::Api(resp) => ClusterError::Api {
                code: resp.code,
                message: resp.message,
            },
            kube::Error::SerdeError(e) => ClusterError::Serialization(e.to_string()),
            other => ClusterError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

/// The cluster reads and writes the autoscaler performs
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Names of every namespace in the cluster
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;

    /// All workloads in a namespace
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;

    /// Pods in a namespace matching a label selector string
    async fn list_pods(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<Pod>, ClusterError>;

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError>;

    /// Write back a full claim object (update semantics)
    async fn replace_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClusterError>;

    /// Read a workload's scale sub-resource
    async fn get_scale(&self, namespace: &str, name: &str) -> Result<Scale, ClusterError>;

    /// Write a workload's scale sub-resource
    async fn replace_scale(
        &self,
        namespace: &str,
        name: &str,
        scale: &Scale,
    ) -> Result<Scale, ClusterError>;
}
