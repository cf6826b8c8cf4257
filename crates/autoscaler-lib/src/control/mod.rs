//! The control loop
//!
//! One cycle runs discovery, then the storage pass and the network pass
//! over every target, one claim or pod at a time. Failures for a single
//! claim, pod or workload are logged and skipped; only a failed discovery
//! ends a cycle early. Between cycles the loop sleeps for the configured
//! interval until shutdown is requested.

use crate::actuator::Actuator;
use crate::cluster::ClusterClient;
use crate::convergence::{ConvergenceWaiter, WaitOutcome, WaitSettings};
use crate::decision::{decide_network, decide_storage};
use crate::discovery::TargetDiscovery;
use crate::error::{Error, Result};
use crate::fields;
use crate::health::{components, HealthRegistry};
use crate::metrics::MetricsGateway;
use crate::models::{Mode, ScalingDecision, Target};
use crate::observability::{AutoscalerMetrics, EventLog, TracingEventLog};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};


/// Policy the loop applies each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Sleep between cycles
    pub interval: Duration,
    /// Disk usage percent above which a claim is grown
    pub disk_resize_threshold: i64,
    /// Ingress bytes/sec above which a namespace is rescaled
    pub ingress_scale_threshold: i64,
    /// Replica count for workloads without a scaling marker
    pub desired_replica_count: i32,
    pub retry: RetryPolicy,
    pub wait: WaitSettings,
    /// Wait for ready replicas after each successful scale write
    pub wait_for_replicas: bool,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub targets: usize,
    pub claims_checked: usize,
    pub storage_resizes: usize,
    pub pods_checked: usize,
    pub namespace_scale_passes: usize,
    pub replica_updates: usize,
    pub fetch_failures: usize,
    pub actuation_failures: usize,
    pub convergence_failures: usize,
}

pub struct ControlLoop {
    discovery: TargetDiscovery,
    gateway: Arc<dyn MetricsGateway>,
    actuator: Actuator,
    waiter: ConvergenceWaiter,
    mode: Mode,
    settings: LoopSettings,
    health: HealthRegistry,
    metrics: AutoscalerMetrics,
    log: Arc<dyn EventLog>,
}

impl ControlLoop {
    pub fn builder() -> ControlLoopBuilder {
        ControlLoopBuilder::new()
    }

    /// Run cycles until `shutdown` fires
    pub async fn run(self, shutdown: Shutdown) {
        info!(
            mode = %self.mode,
            interval_secs = self.settings.interval.as_secs(),
            "Starting control loop"
        );

        while !shutdown.is_triggered() {
            // Errors are already logged and reflected in health
            let _ = self.run_cycle(&shutdown).await;

            if !shutdown.sleep(self.settings.interval).await {
                break;
            }
        }

        info!("Control loop stopped");
    }

    /// Run a single cycle. Only a discovery failure is returned as an error.
    pub async fn run_cycle(&self, shutdown: &Shutdown) -> Result<CycleReport> {
        let start = Instant::now();
        let result = self.cycle(shutdown).await;

        self.metrics.inc_cycles();
        self.metrics
            .observe_cycle_duration(start.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                self.update_health(report).await;
                self.health.record_cycle().await;
                self.health.set_ready(true).await;
                debug!(
                    targets = report.targets,
                    resizes = report.storage_resizes,
                    replica_updates = report.replica_updates,
                    fetch_failures = report.fetch_failures,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Cycle complete"
                );
            }
            Err(err) => {
                self.health
                    .set_unhealthy(components::DISCOVERY, err.to_string())
                    .await;
                self.log.error(
                    "discovery_failed",
                    "Failed to list workloads; retrying next cycle",
                    fields![error = err],
                );
            }
        }

        result
    }

    async fn cycle(&self, shutdown: &Shutdown) -> Result<CycleReport> {
        let discovery = self.discovery.discover().await?;
        self.metrics
            .set_targets_discovered(discovery.targets.len() as i64);

        let mut report = CycleReport {
            targets: discovery.targets.len(),
            ..CycleReport::default()
        };

        if !discovery.found() {
            self.log.warn(
                "no_targets",
                "No workloads are enabled for autoscaling",
                &[],
            );
            return Ok(report);
        }

        if self.mode.storage {
            for target in &discovery.targets {
                if shutdown.is_triggered() {
                    return Ok(report);
                }
                self.storage_pass(target, shutdown, &mut report).await;
            }
        }

        if self.mode.network {
            for target in &discovery.targets {
                if shutdown.is_triggered() {
                    return Ok(report);
                }
                self.network_pass(target, shutdown, &mut report).await;
            }
        }

        Ok(report)
    }

    async fn storage_pass(&self, target: &Target, shutdown: &Shutdown, report: &mut CycleReport) {
        let namespace = target.namespace.as_str();

        for claim in &target.storage_claim_names {
            if shutdown.is_triggered() {
                return;
            }
            report.claims_checked += 1;

            let usage = match self
                .gateway
                .fetch_disk_usage_percent(claim, namespace)
                .await
            {
                Ok(usage) => usage,
                Err(err) => {
                    self.record_fetch_failure(report);
                    self.log.error(
                        "disk_usage_fetch_failed",
                        "Skipping claim without disk usage",
                        fields![namespace = namespace, claim = claim, error = err],
                    );
                    continue;
                }
            };

            let capacity = match self.actuator.storage_capacity(namespace, claim).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    self.log.warn(
                        "claim_size_unknown",
                        "Claim has no parseable storage request",
                        fields![namespace = namespace, claim = claim],
                    );
                    0
                }
                Err(err) => {
                    report.actuation_failures += 1;
                    self.log.error(
                        "claim_read_failed",
                        "Failed to read storage claim",
                        fields![namespace = namespace, claim = claim, error = err],
                    );
                    continue;
                }
            };

            let decision = decide_storage(usage, self.settings.disk_resize_threshold, capacity);
            let ScalingDecision::ResizeStorage { target_size_bytes } = decision else {
                debug!(namespace, claim = %claim, usage, "Disk usage within threshold");
                continue;
            };

            match self
                .actuator
                .resize_storage(namespace, claim, target_size_bytes)
                .await
            {
                Ok(resize) if resize.applied => {
                    report.storage_resizes += 1;
                    let outcome = self
                        .waiter
                        .wait_for_claim_bound(namespace, claim, shutdown)
                        .await;
                    self.record_convergence(
                        outcome,
                        &format!("PersistentVolumeClaim {namespace}/{claim}"),
                        report,
                    );
                }
                Ok(_) => {}
                Err(_) => report.actuation_failures += 1,
            }
        }
    }

    async fn network_pass(&self, target: &Target, shutdown: &Shutdown, report: &mut CycleReport) {
        let pods = match self.discovery.pods_for(target).await {
            Ok(pods) => pods,
            Err(err) => {
                self.log.error(
                    "pod_listing_failed",
                    "Skipping workload whose pods could not be listed",
                    fields![
                        namespace = target.namespace,
                        workload = target.workload_name,
                        error = err
                    ],
                );
                return;
            }
        };

        for pod in &pods {
            if shutdown.is_triggered() {
                return;
            }
            report.pods_checked += 1;

            let usage = match self
                .gateway
                .fetch_network_usage(&pod.name, &pod.namespace)
                .await
            {
                Ok(usage) => usage,
                Err(err) => {
                    self.record_fetch_failure(report);
                    self.log.error(
                        "network_usage_fetch_failed",
                        "Skipping pod without ingress usage",
                        fields![namespace = pod.namespace, pod = pod.name, error = err],
                    );
                    continue;
                }
            };

            match &usage.egress_bytes_per_sec {
                Ok(egress) => self.log.info(
                    "network_usage",
                    "Fetched pod network usage",
                    fields![
                        namespace = pod.namespace,
                        pod = pod.name,
                        ingress = usage.ingress_bytes_per_sec,
                        egress = egress
                    ],
                ),
                Err(err) => {
                    self.record_fetch_failure(report);
                    self.log.warn(
                        "egress_fetch_failed",
                        "Egress usage unavailable; continuing with ingress",
                        fields![
                            namespace = pod.namespace,
                            pod = pod.name,
                            ingress = usage.ingress_bytes_per_sec,
                            error = err
                        ],
                    );
                }
            }

            let decision = decide_network(
                usage.ingress_bytes_per_sec,
                self.settings.ingress_scale_threshold,
                self.settings.desired_replica_count,
            );
            let ScalingDecision::ScaleReplicas { desired_count } = decision else {
                continue;
            };

            report.namespace_scale_passes += 1;
            self.log.info(
                "ingress_threshold_exceeded",
                "Rescaling workloads in namespace",
                fields![
                    namespace = pod.namespace,
                    pod = pod.name,
                    ingress = usage.ingress_bytes_per_sec,
                    threshold = self.settings.ingress_scale_threshold
                ],
            );
            self.scale_pass(&pod.namespace, desired_count, shutdown, report)
                .await;
        }
    }

    async fn scale_pass(
        &self,
        namespace: &str,
        fallback_desired: i32,
        shutdown: &Shutdown,
        report: &mut CycleReport,
    ) {
        let workloads = match self
            .actuator
            .scale_namespace(namespace, fallback_desired, shutdown)
            .await
        {
            Ok(workloads) => workloads,
            Err(err) => {
                report.actuation_failures += 1;
                self.log.error(
                    "workload_listing_failed",
                    "Failed to list workloads for rescaling",
                    fields![namespace = namespace, error = err],
                );
                return;
            }
        };

        for workload in workloads {
            if !workload.outcome.succeeded {
                report.actuation_failures += 1;
                continue;
            }
            report.replica_updates += 1;

            if self.settings.wait_for_replicas {
                let outcome = self
                    .waiter
                    .wait_for_ready_replicas(
                        namespace,
                        &workload.workload,
                        workload.desired_replicas,
                        shutdown,
                    )
                    .await;
                self.record_convergence(
                    outcome,
                    &format!("Deployment {namespace}/{}", workload.workload),
                    report,
                );
            }
        }
    }

    fn record_fetch_failure(&self, report: &mut CycleReport) {
        report.fetch_failures += 1;
        self.metrics.inc_metric_fetch_errors();
    }

    fn record_convergence(&self, outcome: WaitOutcome, resource: &str, report: &mut CycleReport) {
        let timed_out = matches!(outcome, WaitOutcome::TimedOut { .. });
        match outcome.into_result(resource) {
            Ok(()) => self.log.info(
                "converged",
                "Resource reached its desired state",
                fields![resource = resource],
            ),
            Err(err) => {
                report.convergence_failures += 1;
                if timed_out {
                    self.metrics.inc_convergence_timeouts();
                }
                self.log.error(
                    "convergence_failed",
                    "Resource did not converge",
                    fields![resource = resource, error = err],
                );
            }
        }
    }

    async fn update_health(&self, report: &CycleReport) {
        self.health.set_healthy(components::DISCOVERY).await;

        if report.fetch_failures > 0 {
            self.health
                .set_degraded(
                    components::METRICS_GATEWAY,
                    format!("{} metric queries failed", report.fetch_failures),
                )
                .await;
        } else {
            self.health.set_healthy(components::METRICS_GATEWAY).await;
        }

        let actuator_failures = report.actuation_failures + report.convergence_failures;
        if actuator_failures > 0 {
            self.health
                .set_degraded(
                    components::ACTUATOR,
                    format!("{actuator_failures} actuations failed or did not converge"),
                )
                .await;
        } else {
            self.health.set_healthy(components::ACTUATOR).await;
        }
    }
}

/// Builder for creating the control loop
pub struct ControlLoopBuilder {
    cluster: Option<Arc<dyn ClusterClient>>,
    gateway: Option<Arc<dyn MetricsGateway>>,
    mode: Option<Mode>,
    settings: Option<LoopSettings>,
    health: HealthRegistry,
    log: Option<Arc<dyn EventLog>>,
}

impl ControlLoopBuilder {
    pub fn new() -> Self {
        Self {
            cluster: None,
            gateway: None,
            mode: None,
            settings: None,
            health: HealthRegistry::new(),
            log: None,
        }
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn MetricsGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn settings(mut self, settings: LoopSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Share a health registry with the HTTP endpoint
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    /// Event log for every component; defaults to `tracing`
    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> Result<ControlLoop> {
        let cluster = self
            .cluster
            .ok_or_else(|| Error::Config("cluster client is required".to_string()))?;
        let gateway = self
            .gateway
            .ok_or_else(|| Error::Config("metrics gateway is required".to_string()))?;
        let mode = self
            .mode
            .ok_or_else(|| Error::Config("mode is required".to_string()))?;
        let settings = self
            .settings
            .ok_or_else(|| Error::Config("loop settings are required".to_string()))?;
        let log = self
            .log
            .unwrap_or_else(|| Arc::new(TracingEventLog::new("control_loop")));

        Ok(ControlLoop {
            discovery: TargetDiscovery::new(cluster.clone(), log.clone()),
            gateway,
            actuator: Actuator::new(cluster.clone(), settings.retry, log.clone()),
            waiter: ConvergenceWaiter::new(cluster, settings.wait),
            mode,
            settings,
            health: self.health,
            metrics: AutoscalerMetrics::new(),
            log,
        })
    }
}

impl Default for ControlLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
