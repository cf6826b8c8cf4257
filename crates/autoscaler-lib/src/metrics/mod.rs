//! Metrics backend access
//!
//! Usage figures come from a Prometheus-compatible HTTP API. Queries are
//! built from configured templates with the target identity substituted in.

mod prometheus_http;
mod query;

pub use prometheus_http::{parse_sample, PrometheusGateway};
pub use query::QueryTemplates;

use crate::error::Result;
use async_trait::async_trait;

/// Network throughput for one pod, in bytes per second.
///
/// Ingress is always present; egress carries its own outcome so a failed
/// egress query does not discard an ingress value that was already fetched.
#[derive(Debug)]
pub struct NetworkUsage {
    pub ingress_bytes_per_sec: f64,
    pub egress_bytes_per_sec: Result<f64>,
}

/// Source of usage figures for storage claims and pods
#[async_trait]
pub trait MetricsGateway: Send + Sync {
    /// Disk usage of a storage claim as a percentage of its capacity
    async fn fetch_disk_usage_percent(&self, claim_name: &str, namespace: &str) -> Result<f64>;

    /// Ingress then egress throughput for a pod.
    ///
    /// Fails outright only when the ingress query fails; egress is not
    /// queried in that case.
    async fn fetch_network_usage(&self, pod_name: &str, namespace: &str)
        -> Result<NetworkUsage>;
}
