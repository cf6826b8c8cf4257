//! Cluster mutations
//!
//! Storage claims are grown with a single update call. Replica counts are
//! written through the scale sub-resource of every workload in a namespace,
//! each workload under its own bounded retry.

use crate::cluster::quantity::{format_bytes, parse_bytes};
use crate::cluster::ClusterClient;
use crate::decision::{desired_replicas, replica_intent};
use crate::error::{Error, Result};
use crate::fields;
use crate::models::{ActuationOutcome, ScaleIntent};
use crate::observability::{AutoscalerMetrics, EventLog};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::sync::Arc;
use tracing::debug;

const CLAIM_KIND: &str = "PersistentVolumeClaim";
const WORKLOAD_KIND: &str = "Deployment";
const STORAGE_RESOURCE: &str = "storage";

/// Replica count assumed when a workload leaves it unset
const DEFAULT_REPLICAS: i32 = 1;

/// What a storage resize did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeReport {
    pub previous_bytes: i64,
    pub requested_bytes: i64,
    /// False when the requested size was not larger than the live one
    pub applied: bool,
}

/// Result of one workload's replica update
#[derive(Debug)]
pub struct WorkloadScaleReport {
    pub workload: String,
    pub desired_replicas: i32,
    pub outcome: ActuationOutcome,
}

pub struct Actuator {
    cluster: Arc<dyn ClusterClient>,
    retry: RetryPolicy,
    log: Arc<dyn EventLog>,
    metrics: AutoscalerMetrics,
}

impl Actuator {
    pub fn new(cluster: Arc<dyn ClusterClient>, retry: RetryPolicy, log: Arc<dyn EventLog>) -> Self {
        Self {
            cluster,
            retry,
            log,
            metrics: AutoscalerMetrics::new(),
        }
    }

    /// Current storage request of a claim; `None` when absent or unparseable
    pub async fn storage_capacity(&self, namespace: &str, claim_name: &str) -> Result<Option<i64>> {
        let claim = self.read_claim(namespace, claim_name).await?;
        Ok(storage_request(&claim).and_then(|q| parse_bytes(&q.0)))
    }

    /// Grow a claim's storage request to `target_bytes`.
    ///
    /// The live size is re-read first and nothing is written unless the
    /// target is strictly larger. There is no retry.
    pub async fn resize_storage(
        &self,
        namespace: &str,
        claim_name: &str,
        target_bytes: i64,
    ) -> Result<ResizeReport> {
        let result = self.try_resize(namespace, claim_name, target_bytes).await;

        match &result {
            Ok(report) if report.applied => {
                self.metrics.inc_storage_resizes();
                self.log.info(
                    "storage_resized",
                    "Requested larger storage for claim",
                    fields![
                        namespace = namespace,
                        claim = claim_name,
                        from = format_bytes(report.previous_bytes),
                        to = format_bytes(report.requested_bytes)
                    ],
                );
            }
            Ok(report) => self.log.warn(
                "storage_resize_skipped",
                "Computed size is not larger than the current request",
                fields![
                    namespace = namespace,
                    claim = claim_name,
                    current = format_bytes(report.previous_bytes),
                    computed = target_bytes
                ],
            ),
            Err(err) => {
                self.metrics.inc_actuation_failures();
                self.log.error(
                    "storage_resize_failed",
                    "Failed to resize storage claim",
                    fields![namespace = namespace, claim = claim_name, error = err],
                );
            }
        }

        result
    }

    async fn try_resize(
        &self,
        namespace: &str,
        claim_name: &str,
        target_bytes: i64,
    ) -> Result<ResizeReport> {
        let mut claim = self.read_claim(namespace, claim_name).await?;

        let previous_bytes = storage_request(&claim)
            .and_then(|q| parse_bytes(&q.0))
            .ok_or_else(|| Error::Mutation {
                resource: format!("{CLAIM_KIND} {namespace}/{claim_name}"),
                source: crate::cluster::ClusterError::Serialization(
                    "storage request missing or unparseable".to_string(),
                ),
            })?;

        if target_bytes <= previous_bytes {
            return Ok(ResizeReport {
                previous_bytes,
                requested_bytes: previous_bytes,
                applied: false,
            });
        }

        claim
            .spec
            .get_or_insert_with(Default::default)
            .resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(Default::default)
            .insert(
                STORAGE_RESOURCE.to_string(),
                Quantity(format_bytes(target_bytes)),
            );

        self.cluster
            .replace_claim(namespace, &claim)
            .await
            .map_err(|e| Error::from_mutation(CLAIM_KIND, namespace, claim_name, e))?;

        Ok(ResizeReport {
            previous_bytes,
            requested_bytes: target_bytes,
            applied: true,
        })
    }

    async fn read_claim(&self, namespace: &str, claim_name: &str) -> Result<PersistentVolumeClaim> {
        self.cluster
            .get_claim(namespace, claim_name)
            .await
            .map_err(|e| Error::from_read(CLAIM_KIND, namespace, claim_name, e))
    }

    /// Update the replica count of every workload in `namespace`.
    ///
    /// Each workload's count comes from its pod-template scaling markers,
    /// or `fallback_desired` when it carries neither. A workload that
    /// exhausts its attempts does not stop the others. The outer error is
    /// reserved for a failed workload listing.
    pub async fn scale_namespace(
        &self,
        namespace: &str,
        fallback_desired: i32,
        shutdown: &Shutdown,
    ) -> Result<Vec<WorkloadScaleReport>> {
        let deployments = self
            .cluster
            .list_deployments(namespace)
            .await
            .map_err(Error::ClusterQuery)?;

        let mut reports = Vec::with_capacity(deployments.len());
        for deployment in &deployments {
            let Some(name) = deployment.metadata.name.as_deref() else {
                continue;
            };
            let spec = deployment.spec.as_ref();
            let intent = replica_intent(
                spec.and_then(|s| s.template.metadata.as_ref())
                    .and_then(|m| m.annotations.as_ref()),
            );
            let planned = desired_replicas(
                spec.and_then(|s| s.replicas).unwrap_or(DEFAULT_REPLICAS),
                intent,
                fallback_desired,
            );

            let report = self
                .scale_workload(namespace, name, intent, fallback_desired, planned, shutdown)
                .await;
            reports.push(report);
        }

        Ok(reports)
    }

    async fn scale_workload(
        &self,
        namespace: &str,
        name: &str,
        intent: ScaleIntent,
        fallback_desired: i32,
        planned: i32,
        shutdown: &Shutdown,
    ) -> WorkloadScaleReport {
        let cluster = &self.cluster;

        let attempted = self
            .retry
            .run(shutdown, Error::is_retryable, move |attempt| async move {
                let mut scale = cluster
                    .get_scale(namespace, name)
                    .await
                    .map_err(|e| Error::from_read(WORKLOAD_KIND, namespace, name, e))?;

                let current = scale
                    .spec
                    .as_ref()
                    .and_then(|s| s.replicas)
                    .unwrap_or(DEFAULT_REPLICAS);
                let desired = desired_replicas(current, intent, fallback_desired);
                debug!(namespace, workload = name, attempt, current, desired, "Writing scale");

                scale.spec.get_or_insert_with(Default::default).replicas = Some(desired);
                cluster
                    .replace_scale(namespace, name, &scale)
                    .await
                    .map_err(|e| Error::from_mutation(WORKLOAD_KIND, namespace, name, e))?;
                Ok::<_, Error>(desired)
            })
            .await;

        match attempted.result {
            Ok(desired) => {
                self.metrics.inc_replica_updates();
                self.log.info(
                    "replicas_updated",
                    "Updated workload replica count",
                    fields![
                        namespace = namespace,
                        workload = name,
                        replicas = desired,
                        attempts = attempted.attempts
                    ],
                );
                WorkloadScaleReport {
                    workload: name.to_string(),
                    desired_replicas: desired,
                    outcome: ActuationOutcome::success(attempted.attempts),
                }
            }
            Err(err) => {
                self.metrics.inc_actuation_failures();
                self.log.error(
                    "replica_update_failed",
                    "Giving up on workload replica update",
                    fields![
                        namespace = namespace,
                        workload = name,
                        attempts = attempted.attempts,
                        error = err
                    ],
                );
                WorkloadScaleReport {
                    workload: name.to_string(),
                    desired_replicas: planned,
                    outcome: ActuationOutcome::failure(attempted.attempts, err),
                }
            }
        }
    }
}

fn storage_request(claim: &PersistentVolumeClaim) -> Option<&Quantity> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get(STORAGE_RESOURCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{DeploymentFixture, InMemoryCluster};
    use crate::cluster::ClusterError;
    use crate::models::{SCALE_DOWN_ANNOTATION, SCALE_UP_ANNOTATION};
    use crate::observability::{LogLevel, MemoryEventLog};
    use std::time::Duration;
    use tokio::time::Instant;

    fn actuator(cluster: Arc<InMemoryCluster>) -> (Actuator, Arc<MemoryEventLog>) {
        let log = Arc::new(MemoryEventLog::new());
        let actuator = Actuator::new(cluster, RetryPolicy::default(), log.clone());
        (actuator, log)
    }

    fn conflict() -> ClusterError {
        ClusterError::Conflict("the object has been modified".to_string())
    }

    #[tokio::test]
    async fn test_resize_grows_claim_by_half() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_claim("ns1", "data-pvc", "10Gi", "Bound");
        let (actuator, log) = actuator(cluster.clone());

        let report = actuator
            .resize_storage("ns1", "data-pvc", 15 * 1024 * 1024 * 1024)
            .await
            .unwrap();

        assert!(report.applied);
        assert_eq!(report.previous_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(cluster.claim_size("ns1", "data-pvc").as_deref(), Some("15Gi"));
        assert_eq!(log.events("storage_resized").len(), 1);
    }

    #[tokio::test]
    async fn test_resize_never_shrinks() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_claim("ns1", "data-pvc", "10Gi", "Bound");
        let (actuator, _log) = actuator(cluster.clone());

        let report = actuator.resize_storage("ns1", "data-pvc", 1024).await.unwrap();

        assert!(!report.applied);
        assert!(cluster.claim_writes().is_empty());
        assert_eq!(cluster.claim_size("ns1", "data-pvc").as_deref(), Some("10Gi"));
    }

    #[tokio::test]
    async fn test_resize_missing_claim() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (actuator, log) = actuator(cluster);

        let err = actuator.resize_storage("ns1", "gone", 100).await.unwrap_err();

        assert!(matches!(err, Error::NotFound { kind: CLAIM_KIND, .. }));
        assert_eq!(log.count_level(LogLevel::Error), 1);
    }

    #[tokio::test]
    async fn test_resize_conflict_is_not_retried() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_claim("ns1", "data-pvc", "10Gi", "Bound");
        cluster.fail_claim_writes("data-pvc", vec![conflict()]);
        let (actuator, log) = actuator(cluster.clone());

        let err = actuator
            .resize_storage("ns1", "data-pvc", 15 * 1024 * 1024 * 1024)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UpdateConflict { .. }));
        assert_eq!(cluster.claim_write_attempts("data-pvc"), 1);
        assert!(cluster.claim_writes().is_empty());
        assert_eq!(cluster.claim_size("ns1", "data-pvc").as_deref(), Some("10Gi"));
        assert_eq!(log.events("storage_resize_failed").len(), 1);
    }

    #[tokio::test]
    async fn test_resize_rejected_write_is_a_mutation_error() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_claim("ns1", "data-pvc", "10Gi", "Bound");
        cluster.fail_claim_writes(
            "data-pvc",
            vec![ClusterError::Api {
                code: 422,
                message: "storage class does not allow expansion".to_string(),
            }],
        );
        let (actuator, _log) = actuator(cluster.clone());

        let err = actuator
            .resize_storage("ns1", "data-pvc", 15 * 1024 * 1024 * 1024)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Mutation { source: ClusterError::Api { code: 422, .. }, .. }
        ));
        assert_eq!(cluster.claim_write_attempts("data-pvc"), 1);
    }

    #[tokio::test]
    async fn test_storage_capacity() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_claim("ns1", "data-pvc", "3", "Bound");
        cluster.add_claim("ns1", "odd-pvc", "lots", "Bound");
        let (actuator, _log) = actuator(cluster);

        assert_eq!(actuator.storage_capacity("ns1", "data-pvc").await.unwrap(), Some(3));
        assert_eq!(actuator.storage_capacity("ns1", "odd-pvc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scale_follows_markers() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment(
            DeploymentFixture::new("ns1", "up")
                .replicas(Some(2))
                .template_annotation(SCALE_UP_ANNOTATION, "true")
                .build(),
        );
        cluster.add_deployment(
            DeploymentFixture::new("ns1", "down")
                .replicas(Some(1))
                .template_annotation(SCALE_DOWN_ANNOTATION, "true")
                .build(),
        );
        cluster.add_deployment(
            DeploymentFixture::new("ns1", "both")
                .replicas(Some(4))
                .template_annotation(SCALE_UP_ANNOTATION, "true")
                .template_annotation(SCALE_DOWN_ANNOTATION, "true")
                .build(),
        );
        cluster.add_deployment(DeploymentFixture::new("ns1", "plain").replicas(None).build());
        cluster.add_deployment(DeploymentFixture::new("ns2", "elsewhere").build());
        let (actuator, _log) = actuator(cluster.clone());

        let reports = actuator
            .scale_namespace("ns1", 3, &Shutdown::never())
            .await
            .unwrap();

        assert_eq!(reports.len(), 4);
        assert!(reports.iter().all(|r| r.outcome.succeeded));
        assert_eq!(cluster.replicas("ns1", "up"), Some(3));
        assert_eq!(cluster.replicas("ns1", "down"), Some(1));
        assert_eq!(cluster.replicas("ns1", "both"), Some(5));
        assert_eq!(cluster.replicas("ns1", "plain"), Some(3));
        assert_eq!(cluster.scale_writes("elsewhere"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_retries_conflicts() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment(DeploymentFixture::new("ns1", "web").build());
        cluster.fail_scale_writes("web", vec![conflict()]);
        let (actuator, _log) = actuator(cluster.clone());

        let reports = actuator
            .scale_namespace("ns1", 2, &Shutdown::never())
            .await
            .unwrap();

        assert!(reports[0].outcome.succeeded);
        assert_eq!(reports[0].outcome.attempts_used, 2);
        assert_eq!(cluster.scale_writes("web"), 2);
        assert_eq!(cluster.replicas("ns1", "web"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_workload_does_not_stop_others() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment(DeploymentFixture::new("ns1", "stuck").build());
        cluster.add_deployment(DeploymentFixture::new("ns1", "fine").build());
        cluster.fail_scale_writes("stuck", vec![conflict(), conflict(), conflict(), conflict()]);
        let (actuator, log) = actuator(cluster.clone());
        let start = Instant::now();

        let reports = actuator
            .scale_namespace("ns1", 2, &Shutdown::never())
            .await
            .unwrap();

        let stuck = &reports[0];
        assert!(!stuck.outcome.succeeded);
        assert_eq!(stuck.outcome.attempts_used, 3);
        assert!(matches!(
            stuck.outcome.last_error,
            Some(Error::UpdateConflict { .. })
        ));
        assert_eq!(cluster.scale_writes("stuck"), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));

        assert!(reports[1].outcome.succeeded);
        assert_eq!(cluster.replicas("ns1", "fine"), Some(2));
        assert_eq!(log.events("replica_update_failed").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_write_is_not_retried() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment(DeploymentFixture::new("ns1", "web").build());
        cluster.fail_scale_writes(
            "web",
            vec![ClusterError::Api {
                code: 403,
                message: "forbidden".to_string(),
            }],
        );
        let (actuator, _log) = actuator(cluster.clone());

        let reports = actuator
            .scale_namespace("ns1", 2, &Shutdown::never())
            .await
            .unwrap();

        assert_eq!(reports[0].outcome.attempts_used, 1);
        assert_eq!(cluster.scale_writes("web"), 1);
    }

    #[tokio::test]
    async fn test_workload_listing_failure() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.fail_deployment_list("ns1");
        let (actuator, _log) = actuator(cluster);

        let err = actuator
            .scale_namespace("ns1", 2, &Shutdown::never())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ClusterQuery(_)));
    }
}
