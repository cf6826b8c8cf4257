//! Autoscaler library for annotated Kubernetes workloads
//!
//! This crate provides the control loop that:
//! - Discovers workloads carrying the `autoscaler/enabled` marker
//! - Queries Prometheus for disk and network usage
//! - Expands storage claims and adjusts replica counts
//! - Waits for mutated resources to converge
//! - Reports health and Prometheus metrics for itself

pub mod actuator;
pub mod cluster;
pub mod config;
pub mod control;
pub mod convergence;
pub mod decision;
pub mod discovery;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod retry;
pub mod shutdown;

pub use actuator::{Actuator, ResizeReport, WorkloadScaleReport};
pub use cluster::{ClusterClient, ClusterError, KubeCluster};
pub use config::AutoscalerConfig;
pub use control::{ControlLoop, ControlLoopBuilder, CycleReport, LoopSettings};
pub use convergence::{AbortReason, ConvergenceWaiter, WaitOutcome, WaitSettings};
pub use discovery::{Discovery, TargetDiscovery};
pub use error::{Error, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use metrics::{MetricsGateway, NetworkUsage, PrometheusGateway, QueryTemplates};
pub use models::*;
pub use observability::{AutoscalerMetrics, EventLog, MemoryEventLog, TracingEventLog};
pub use retry::{Backoff, RetryPolicy};
pub use shutdown::{Shutdown, ShutdownTrigger};
