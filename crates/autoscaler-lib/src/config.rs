//! Autoscaler policy file
//!
//! The policy file is YAML. Query templates live either inline under
//! `prometheus:` or in a separate file named by `prometheus.queriesFile`,
//! resolved relative to the policy file.

use crate::control::LoopSettings;
use crate::convergence::WaitSettings;
use crate::error::{Error, Result};
use crate::metrics::QueryTemplates;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level policy
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerConfig {
    /// Replica count applied to workloads without a scaling marker
    pub desired_replica_count: i32,
    /// Minutes between cycles
    pub interval: u64,
    pub prometheus: PrometheusSettings,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub convergence: ConvergenceSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusSettings {
    pub url: String,
    #[serde(default)]
    pub disk_usage_query: Option<String>,
    #[serde(default)]
    pub network_usage_queries: Option<NetworkQueries>,
    #[serde(default, rename = "queriesFile")]
    pub queries_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkQueries {
    pub ingress: String,
    pub egress: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub disk_usage: DiskThresholds,
    pub network_usage: NetworkThresholds,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DiskThresholds {
    /// Percent
    pub resize: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct NetworkThresholds {
    pub ingress: IngressThreshold,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IngressThreshold {
    /// Bytes per second
    pub scale: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_wait_for_replicas")]
    pub wait_for_replicas: bool,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_timeout_secs(),
            wait_for_replicas: default_wait_for_replicas(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
    /// Upper bound for exponential delays
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
            strategy: default_strategy(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_wait_for_replicas() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_secs() -> u64 {
    2
}

fn default_strategy() -> RetryStrategy {
    RetryStrategy::Fixed
}

fn default_max_delay_secs() -> u64 {
    30
}

/// Layout of a standalone queries file; keys may sit at the top level or
/// under `prometheus:`
#[derive(Debug, Default, Deserialize)]
struct QueriesFile {
    #[serde(default)]
    disk_usage_query: Option<String>,
    #[serde(default)]
    network_usage_queries: Option<NetworkQueries>,
    #[serde(default)]
    prometheus: Option<Box<QueriesFile>>,
}

impl QueriesFile {
    fn flatten(self) -> (Option<String>, Option<NetworkQueries>) {
        let (nested_disk, nested_network) = self
            .prometheus
            .map(|nested| nested.flatten())
            .unwrap_or((None, None));
        (
            self.disk_usage_query.or(nested_disk),
            self.network_usage_queries.or(nested_network),
        )
    }
}

impl AutoscalerConfig {
    /// Read, resolve and validate a policy file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&raw, base_dir)
    }

    /// Parse a policy document; a relative `queriesFile` resolves against `base_dir`
    pub fn from_yaml(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut config: AutoscalerConfig = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("malformed policy file: {e}")))?;
        config.resolve_queries_file(base_dir)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill templates missing inline from the referenced queries file
    fn resolve_queries_file(&mut self, base_dir: &Path) -> Result<()> {
        let Some(file) = self.prometheus.queries_file.clone() else {
            return Ok(());
        };
        let path = if file.is_absolute() {
            file
        } else {
            base_dir.join(file)
        };

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let queries: QueriesFile = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("malformed queries file {}: {e}", path.display())))?;

        let (disk, network) = queries.flatten();
        if self.prometheus.disk_usage_query.is_none() {
            self.prometheus.disk_usage_query = disk;
        }
        if self.prometheus.network_usage_queries.is_none() {
            self.prometheus.network_usage_queries = network;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval < 1 {
            return Err(Error::Config("interval must be at least 1 minute".to_string()));
        }
        if self.desired_replica_count < 1 {
            return Err(Error::Config(
                "desiredReplicaCount must be at least 1".to_string(),
            ));
        }
        if self.prometheus.url.trim().is_empty() {
            return Err(Error::Config("prometheus.url must not be empty".to_string()));
        }

        let disk = self.prometheus.disk_usage_query.as_deref().unwrap_or("");
        if disk.trim().is_empty() {
            return Err(Error::Config("disk_usage_query must not be empty".to_string()));
        }
        match &self.prometheus.network_usage_queries {
            Some(q) if !q.ingress.trim().is_empty() && !q.egress.trim().is_empty() => {}
            _ => {
                return Err(Error::Config(
                    "network_usage_queries.ingress and .egress must not be empty".to_string(),
                ))
            }
        }

        if self.retry.max_attempts < 1 {
            return Err(Error::Config("retry.maxAttempts must be at least 1".to_string()));
        }
        if self.convergence.poll_interval_secs < 1 {
            return Err(Error::Config(
                "convergence.pollIntervalSecs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_templates(&self) -> QueryTemplates {
        let network = self.prometheus.network_usage_queries.clone();
        QueryTemplates {
            disk_usage: self.prometheus.disk_usage_query.clone().unwrap_or_default(),
            ingress: network.as_ref().map(|q| q.ingress.clone()).unwrap_or_default(),
            egress: network.map(|q| q.egress).unwrap_or_default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry.delay_secs);
        match self.retry.strategy {
            RetryStrategy::Fixed => RetryPolicy::fixed(self.retry.max_attempts, delay),
            RetryStrategy::Exponential => RetryPolicy::exponential(
                self.retry.max_attempts,
                delay,
                Duration::from_secs(self.retry.max_delay_secs),
            ),
        }
    }

    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_secs(self.convergence.poll_interval_secs),
            timeout: Duration::from_secs(self.convergence.timeout_secs),
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.interval.saturating_mul(60))
    }

    /// Everything the control loop needs from the policy
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            interval: self.cycle_interval(),
            disk_resize_threshold: self.thresholds.disk_usage.resize,
            ingress_scale_threshold: self.thresholds.network_usage.ingress.scale,
            desired_replica_count: self.desired_replica_count,
            retry: self.retry_policy(),
            wait: self.wait_settings(),
            wait_for_replicas: self.convergence.wait_for_replicas,
        }
    }
}
