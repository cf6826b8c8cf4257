//! Target discovery
//!
//! Scans every namespace for workloads opted in through the
//! `autoscaler/enabled` annotation and resolves their storage claims and,
//! on demand, their running pods.

use crate::cluster::selector::format_label_selector;
use crate::cluster::ClusterClient;
use crate::error::{Error, Result};
use crate::fields;
use crate::models::{PodRef, Target, ENABLED_ANNOTATION, MARKER_VALUE};
use crate::observability::EventLog;
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use tracing::debug;

/// Eligible workloads found in one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub targets: Vec<Target>,
}

impl Discovery {
    /// An empty scan means nothing to do this cycle; it is not an error
    pub fn found(&self) -> bool {
        !self.targets.is_empty()
    }
}

pub struct TargetDiscovery {
    cluster: Arc<dyn ClusterClient>,
    log: Arc<dyn EventLog>,
}

impl TargetDiscovery {
    pub fn new(cluster: Arc<dyn ClusterClient>, log: Arc<dyn EventLog>) -> Self {
        Self { cluster, log }
    }

    /// Scan all namespaces. Any listing failure ends the scan.
    pub async fn discover(&self) -> Result<Discovery> {
        let namespaces = self
            .cluster
            .list_namespaces()
            .await
            .map_err(Error::ClusterQuery)?;

        let mut targets = Vec::new();
        for namespace in &namespaces {
            let deployments = self
                .cluster
                .list_deployments(namespace)
                .await
                .map_err(Error::ClusterQuery)?;

            targets.extend(
                deployments
                    .iter()
                    .filter(|d| is_enabled(d))
                    .map(|d| target_for(namespace, d)),
            );
        }

        debug!(
            namespaces = namespaces.len(),
            targets = targets.len(),
            "Discovery scan complete"
        );
        if !targets.is_empty() {
            self.log.info(
                "targets_discovered",
                "Found workloads enabled for autoscaling",
                fields![count = targets.len()],
            );
        }

        Ok(Discovery { targets })
    }

    /// Running pods selected by the target's workload selector.
    ///
    /// A workload without selector terms yields no pods.
    pub async fn pods_for(&self, target: &Target) -> Result<Vec<PodRef>> {
        let namespace = target.namespace.as_str();
        let name = target.workload_name.as_str();

        let deployment = self
            .cluster
            .get_deployment(namespace, name)
            .await
            .map_err(|e| Error::from_read("Deployment", namespace, name, e))?;

        let selector = deployment
            .spec
            .as_ref()
            .map(|spec| format_label_selector(&spec.selector))
            .unwrap_or_default();
        if selector.is_empty() {
            self.log.warn(
                "selector_missing",
                "Workload has no pod selector; skipping network checks",
                fields![namespace = namespace, workload = name],
            );
            return Ok(Vec::new());
        }

        let pods = self
            .cluster
            .list_pods(namespace, &selector)
            .await
            .map_err(Error::ClusterQuery)?;

        Ok(pods
            .into_iter()
            .filter_map(|pod| {
                let pod_name = pod.metadata.name?;
                Some(PodRef {
                    name: pod_name,
                    namespace: pod
                        .metadata
                        .namespace
                        .unwrap_or_else(|| namespace.to_string()),
                })
            })
            .collect())
    }
}

/// Exact, case-sensitive match on the enablement annotation
fn is_enabled(deployment: &Deployment) -> bool {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ENABLED_ANNOTATION))
        .map(String::as_str)
        == Some(MARKER_VALUE)
}

/// Claim names in volume declaration order, duplicates kept
fn claim_names(deployment: &Deployment) -> Vec<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|claim| claim.claim_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn target_for(namespace: &str, deployment: &Deployment) -> Target {
    Target {
        namespace: namespace.to_string(),
        workload_name: deployment.metadata.name.clone().unwrap_or_default(),
        storage_claim_names: claim_names(deployment),
    }
}
