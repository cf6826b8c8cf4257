//! In-memory cluster used by the unit and scenario tests

use super::{ClusterClient, ClusterError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec, ScaleStatus};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
    Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    namespaces: Vec<String>,
    deployments: Vec<Deployment>,
    claims: Vec<PersistentVolumeClaim>,
    pods: Vec<Pod>,
    failing_namespace_list: bool,
    failing_deployment_lists: HashSet<String>,
    failing_claim_reads: HashSet<String>,
    failing_deployment_reads: HashSet<String>,
    scale_write_failures: HashMap<String, VecDeque<ClusterError>>,
    scale_writes: HashMap<String, usize>,
    claim_write_failures: HashMap<String, VecDeque<ClusterError>>,
    claim_write_attempts: HashMap<String, usize>,
    claim_writes: Vec<String>,
    /// Phase a claim reports after being resized
    phase_after_resize: Option<String>,
    /// Whether ready replicas immediately follow a scale write
    ready_follows_scale: bool,
}

/// Scripted cluster state with call accounting
pub(crate) struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase_after_resize: Some("Bound".to_string()),
                ready_follows_scale: true,
                ..State::default()
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.with_state(|s| {
            if !s.namespaces.iter().any(|n| n == namespace) {
                s.namespaces.push(namespace.to_string());
            }
        });
    }

    pub fn add_deployment(&self, deployment: Deployment) {
        if let Some(ns) = deployment.metadata.namespace.clone() {
            self.add_namespace(&ns);
        }
        self.with_state(|s| s.deployments.push(deployment));
    }

    pub fn add_claim(&self, namespace: &str, name: &str, size: &str, phase: &str) {
        let claim = PersistentVolumeClaim {
            metadata: meta(namespace, name),
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(size.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        };
        self.with_state(|s| s.claims.push(claim));
    }

    pub fn add_pod(&self, namespace: &str, name: &str, labels: &[(&str, &str)]) {
        let mut metadata = meta(namespace, name);
        metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self.with_state(|s| {
            s.pods.push(Pod {
                metadata,
                ..Default::default()
            })
        });
    }

    pub fn fail_namespace_list(&self) {
        self.with_state(|s| s.failing_namespace_list = true);
    }

    pub fn fail_deployment_list(&self, namespace: &str) {
        self.with_state(|s| {
            s.failing_deployment_lists.insert(namespace.to_string());
        });
    }

    pub fn fail_claim_reads(&self, name: &str) {
        self.with_state(|s| {
            s.failing_claim_reads.insert(name.to_string());
        });
    }

    pub fn fail_deployment_reads(&self, name: &str) {
        self.with_state(|s| {
            s.failing_deployment_reads.insert(name.to_string());
        });
    }

    /// Queue errors returned by the next writes of a claim
    pub fn fail_claim_writes(&self, name: &str, errors: Vec<ClusterError>) {
        self.with_state(|s| {
            s.claim_write_failures
                .entry(name.to_string())
                .or_default()
                .extend(errors);
        });
    }

    /// Queue errors returned by the next scale writes for a workload
    pub fn fail_scale_writes(&self, name: &str, errors: Vec<ClusterError>) {
        self.with_state(|s| {
            s.scale_write_failures
                .entry(name.to_string())
                .or_default()
                .extend(errors);
        });
    }

    pub fn set_phase_after_resize(&self, phase: Option<&str>) {
        self.with_state(|s| s.phase_after_resize = phase.map(str::to_string));
    }

    pub fn set_ready_follows_scale(&self, follows: bool) {
        self.with_state(|s| s.ready_follows_scale = follows);
    }

    pub fn scale_writes(&self, name: &str) -> usize {
        self.with_state(|s| s.scale_writes.get(name).copied().unwrap_or(0))
    }

    /// Writes attempted for a claim, failed ones included
    pub fn claim_write_attempts(&self, name: &str) -> usize {
        self.with_state(|s| s.claim_write_attempts.get(name).copied().unwrap_or(0))
    }

    /// Claims written successfully, in order
    pub fn claim_writes(&self) -> Vec<String> {
        self.with_state(|s| s.claim_writes.clone())
    }

    pub fn claim_size(&self, namespace: &str, name: &str) -> Option<String> {
        self.with_state(|s| {
            find_claim(&s.claims, namespace, name)
                .and_then(|c| c.spec.as_ref())
                .and_then(|spec| spec.resources.as_ref())
                .and_then(|r| r.requests.as_ref())
                .and_then(|req| req.get("storage"))
                .map(|q| q.0.clone())
        })
    }

    pub fn replicas(&self, namespace: &str, name: &str) -> Option<i32> {
        self.with_state(|s| {
            find_deployment(&s.deployments, namespace, name)
                .and_then(|d| d.spec.as_ref())
                .and_then(|spec| spec.replicas)
        })
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn matches(object: &ObjectMeta, namespace: &str, name: &str) -> bool {
    object.namespace.as_deref() == Some(namespace) && object.name.as_deref() == Some(name)
}

fn find_deployment<'a>(list: &'a [Deployment], ns: &str, name: &str) -> Option<&'a Deployment> {
    list.iter().find(|d| matches(&d.metadata, ns, name))
}

fn find_claim<'a>(
    list: &'a [PersistentVolumeClaim],
    ns: &str,
    name: &str,
) -> Option<&'a PersistentVolumeClaim> {
    list.iter().find(|c| matches(&c.metadata, ns, name))
}

/// Only `key=value` terms are understood
fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v),
            None => false,
        })
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        self.with_state(|s| {
            if s.failing_namespace_list {
                return Err(ClusterError::Transport("connection refused".into()));
            }
            Ok(s.namespaces.clone())
        })
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError> {
        self.with_state(|s| {
            if s.failing_deployment_lists.contains(namespace) {
                return Err(ClusterError::Api {
                    code: 403,
                    message: "forbidden".into(),
                });
            }
            Ok(s.deployments
                .iter()
                .filter(|d| d.metadata.namespace.as_deref() == Some(namespace))
                .cloned()
                .collect())
        })
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        self.with_state(|s| {
            if s.failing_deployment_reads.contains(name) {
                return Err(ClusterError::Transport("read timed out".into()));
            }
            find_deployment(&s.deployments, namespace, name)
                .cloned()
                .ok_or(ClusterError::NotFound)
        })
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.with_state(|s| {
            Ok(s.pods
                .iter()
                .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
                .filter(|p| selector_matches(label_selector, p.metadata.labels.as_ref()))
                .cloned()
                .collect())
        })
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        self.with_state(|s| {
            if s.failing_claim_reads.contains(name) {
                return Err(ClusterError::Transport("read timed out".into()));
            }
            find_claim(&s.claims, namespace, name)
                .cloned()
                .ok_or(ClusterError::NotFound)
        })
    }

    async fn replace_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        self.with_state(|s| {
            *s.claim_write_attempts.entry(name.clone()).or_default() += 1;
            if let Some(err) = s
                .claim_write_failures
                .get_mut(&name)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }

            let phase = s.phase_after_resize.clone();
            let slot = s
                .claims
                .iter_mut()
                .find(|c| matches(&c.metadata, namespace, &name))
                .ok_or(ClusterError::NotFound)?;
            let mut updated = claim.clone();
            updated.status = Some(PersistentVolumeClaimStatus {
                phase,
                ..Default::default()
            });
            *slot = updated.clone();
            s.claim_writes.push(name);
            Ok(updated)
        })
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> Result<Scale, ClusterError> {
        self.with_state(|s| {
            let deployment =
                find_deployment(&s.deployments, namespace, name).ok_or(ClusterError::NotFound)?;
            let replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas);
            Ok(Scale {
                metadata: meta(namespace, name),
                spec: Some(ScaleSpec { replicas }),
                status: Some(ScaleStatus {
                    replicas: replicas.unwrap_or(1),
                    selector: None,
                }),
            })
        })
    }

    async fn replace_scale(
        &self,
        namespace: &str,
        name: &str,
        scale: &Scale,
    ) -> Result<Scale, ClusterError> {
        self.with_state(|s| {
            *s.scale_writes.entry(name.to_string()).or_default() += 1;

            if let Some(err) = s
                .scale_write_failures
                .get_mut(name)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }

            let ready_follows = s.ready_follows_scale;
            let replicas = scale.spec.as_ref().and_then(|spec| spec.replicas);
            let deployment = s
                .deployments
                .iter_mut()
                .find(|d| matches(&d.metadata, namespace, name))
                .ok_or(ClusterError::NotFound)?;

            deployment.spec.get_or_insert_with(Default::default).replicas = replicas;
            if ready_follows {
                deployment
                    .status
                    .get_or_insert_with(DeploymentStatus::default)
                    .ready_replicas = replicas;
            }
            Ok(scale.clone())
        })
    }
}

/// Builder for test workloads
pub(crate) struct DeploymentFixture {
    deployment: Deployment,
}

impl DeploymentFixture {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            deployment: Deployment {
                metadata: meta(namespace, name),
                spec: Some(DeploymentSpec {
                    replicas: Some(1),
                    selector: LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            "app".to_string(),
                            name.to_string(),
                        )])),
                        match_expressions: None,
                    },
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta::default()),
                        spec: Some(PodSpec::default()),
                    },
                    ..Default::default()
                }),
                status: None,
            },
        }
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.deployment
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn enabled(self) -> Self {
        self.annotation(crate::models::ENABLED_ANNOTATION, crate::models::MARKER_VALUE)
    }

    pub fn template_annotation(mut self, key: &str, value: &str) -> Self {
        if let Some(spec) = self.deployment.spec.as_mut() {
            spec.template
                .metadata
                .get_or_insert_with(ObjectMeta::default)
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn replicas(mut self, replicas: Option<i32>) -> Self {
        if let Some(spec) = self.deployment.spec.as_mut() {
            spec.replicas = replicas;
        }
        self
    }

    pub fn claim_volume(mut self, volume_name: &str, claim_name: &str) -> Self {
        self.push_volume(Volume {
            name: volume_name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                read_only: None,
            }),
            ..Default::default()
        });
        self
    }

    pub fn empty_dir_volume(mut self, volume_name: &str) -> Self {
        self.push_volume(Volume {
            name: volume_name.to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        });
        self
    }

    fn push_volume(&mut self, volume: Volume) {
        if let Some(spec) = self.deployment.spec.as_mut() {
            spec.template
                .spec
                .get_or_insert_with(PodSpec::default)
                .volumes
                .get_or_insert_with(Vec::new)
                .push(volume);
        }
    }

    /// Reports every requested replica as ready
    pub fn build(mut self) -> Deployment {
        let replicas = self.deployment.spec.as_ref().and_then(|spec| spec.replicas);
        self.deployment.status = Some(DeploymentStatus {
            ready_replicas: replicas,
            ..Default::default()
        });
        self.deployment
    }
}
