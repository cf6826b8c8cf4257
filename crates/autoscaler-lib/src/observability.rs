//! Observability infrastructure for the autoscaler
//!
//! Provides:
//! - An injected event log capability ([`EventLog`]) that components write to
//! - Prometheus metrics for cycles, fetch failures and actuations

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::fmt;
use std::sync::{Mutex, OnceLock};
use tracing::{error, info, warn};

/// Severity of an event log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    /// Unrecoverable for the current operation; never exits the process
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Build an event field list: `fields![namespace = ns, claim = name]`
#[macro_export]
macro_rules! fields {
    ($($key:ident = $value:expr),* $(,)?) => {
        &[$((stringify!($key), $value.to_string())),*]
    };
}

/// Where components report what they did
pub trait EventLog: Send + Sync {
    fn record(&self, level: LogLevel, event: &str, message: &str, fields: &[(&str, String)]);

    fn info(&self, event: &str, message: &str, fields: &[(&str, String)]) {
        self.record(LogLevel::Info, event, message, fields);
    }

    fn warn(&self, event: &str, message: &str, fields: &[(&str, String)]) {
        self.record(LogLevel::Warn, event, message, fields);
    }

    fn error(&self, event: &str, message: &str, fields: &[(&str, String)]) {
        self.record(LogLevel::Error, event, message, fields);
    }

    fn fatal(&self, event: &str, message: &str, fields: &[(&str, String)]) {
        self.record(LogLevel::Fatal, event, message, fields);
    }
}

/// Forwards events to `tracing`
#[derive(Debug, Clone)]
pub struct TracingEventLog {
    component: String,
}

impl TracingEventLog {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

fn render_fields(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl EventLog for TracingEventLog {
    fn record(&self, level: LogLevel, event: &str, message: &str, fields: &[(&str, String)]) {
        let details = render_fields(fields);
        match level {
            LogLevel::Info => info!(
                event = %event,
                component = %self.component,
                details = %details,
                "{message}"
            ),
            LogLevel::Warn => warn!(
                event = %event,
                component = %self.component,
                details = %details,
                "{message}"
            ),
            LogLevel::Error => error!(
                event = %event,
                component = %self.component,
                details = %details,
                "{message}"
            ),
            LogLevel::Fatal => error!(
                event = %event,
                component = %self.component,
                details = %details,
                fatal = true,
                "{message}"
            ),
        }
    }
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub event: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Keeps events in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Entries with the given event name
    pub fn events(&self, event: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }

    pub fn count_level(&self, level: LogLevel) -> usize {
        self.entries().iter().filter(|e| e.level == level).count()
    }
}

impl EventLog for MemoryEventLog {
    fn record(&self, level: LogLevel, event: &str, message: &str, fields: &[(&str, String)]) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry {
                level,
                event: event.to_string(),
                message: message.to_string(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            });
        }
    }
}

/// Default histogram buckets for cycle duration (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

struct MetricsInner {
    cycles: IntCounter,
    cycle_duration_seconds: Histogram,
    targets_discovered: IntGauge,
    metric_fetch_errors: IntCounter,
    storage_resizes: IntCounter,
    replica_updates: IntCounter,
    actuation_failures: IntCounter,
    convergence_timeouts: IntCounter,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            cycles: register_int_counter!(
                "autoscaler_cycles_total",
                "Number of control loop cycles started"
            )
            .expect("Failed to register cycles_total"),

            cycle_duration_seconds: register_histogram!(
                "autoscaler_cycle_duration_seconds",
                "Time spent in one control loop cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            targets_discovered: register_int_gauge!(
                "autoscaler_targets_discovered",
                "Number of workloads with the autoscaler enabled in the last cycle"
            )
            .expect("Failed to register targets_discovered"),

            metric_fetch_errors: register_int_counter!(
                "autoscaler_metric_fetch_errors_total",
                "Metric queries that failed or returned no usable value"
            )
            .expect("Failed to register metric_fetch_errors_total"),

            storage_resizes: register_int_counter!(
                "autoscaler_storage_resizes_total",
                "Storage claims expanded"
            )
            .expect("Failed to register storage_resizes_total"),

            replica_updates: register_int_counter!(
                "autoscaler_replica_updates_total",
                "Workload scale sub-resource updates that succeeded"
            )
            .expect("Failed to register replica_updates_total"),

            actuation_failures: register_int_counter!(
                "autoscaler_actuation_failures_total",
                "Resize or scale actuations that failed"
            )
            .expect("Failed to register actuation_failures_total"),

            convergence_timeouts: register_int_counter!(
                "autoscaler_convergence_timeouts_total",
                "Convergence waits that timed out"
            )
            .expect("Failed to register convergence_timeouts_total"),
        }
    }
}

/// Autoscaler metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AutoscalerMetrics {
    _private: (),
}

impl Default for AutoscalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoscalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MetricsInner {
        GLOBAL_METRICS.get_or_init(MetricsInner::new)
    }

    pub fn inc_cycles(&self) {
        self.inner().cycles.inc();
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner().cycle_duration_seconds.observe(duration_secs);
    }

    pub fn set_targets_discovered(&self, count: i64) {
        self.inner().targets_discovered.set(count);
    }

    pub fn inc_metric_fetch_errors(&self) {
        self.inner().metric_fetch_errors.inc();
    }

    pub fn inc_storage_resizes(&self) {
        self.inner().storage_resizes.inc();
    }

    pub fn inc_replica_updates(&self) {
        self.inner().replica_updates.inc();
    }

    pub fn inc_actuation_failures(&self) {
        self.inner().actuation_failures.inc();
    }

    pub fn inc_convergence_timeouts(&self) {
        self.inner().convergence_timeouts.inc();
    }
}
