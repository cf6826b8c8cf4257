//! Threshold policy
//!
//! Pure functions mapping a fetched metric and a configured threshold to a
//! [`ScalingDecision`]. Metric values are truncated toward zero before the
//! comparison, so `70.9` does not exceed a threshold of `70`.

use crate::models::{
    ScaleIntent, ScalingDecision, MARKER_VALUE, SCALE_DOWN_ANNOTATION, SCALE_UP_ANNOTATION,
};
use std::collections::BTreeMap;

/// Minimum replica count a scale-down may reach
pub const MIN_REPLICAS: i32 = 1;

/// Truncate a metric for threshold comparison (NaN truncates to 0)
fn truncated(value: f64) -> i64 {
    value.trunc() as i64
}

/// Whether a metric value crosses a threshold
pub fn exceeds(value: f64, threshold: i64) -> bool {
    truncated(value) > threshold
}

/// Fixed +50% growth, rounded down and never overflowing
pub fn resize_target(current_bytes: i64) -> i64 {
    current_bytes.saturating_add(current_bytes / 2)
}

/// Storage policy: grow the claim when disk usage crosses the threshold.
///
/// Claims with an unknown or zero size are left alone.
pub fn decide_storage(usage_percent: f64, threshold: i64, current_bytes: i64) -> ScalingDecision {
    if !exceeds(usage_percent, threshold) || current_bytes <= 0 {
        return ScalingDecision::NoAction;
    }

    ScalingDecision::ResizeStorage {
        target_size_bytes: resize_target(current_bytes),
    }
}

/// Network policy: ingress above the threshold triggers a namespace-wide
/// replica pass. `fallback_desired` applies to workloads carrying no
/// scaling marker; marked workloads derive their own count at actuation.
pub fn decide_network(
    ingress_bytes_per_sec: f64,
    threshold: i64,
    fallback_desired: i32,
) -> ScalingDecision {
    if exceeds(ingress_bytes_per_sec, threshold) {
        ScalingDecision::ScaleReplicas {
            desired_count: fallback_desired.max(MIN_REPLICAS),
        }
    } else {
        ScalingDecision::NoAction
    }
}

/// Read the scaling intent from pod-template annotations; scale-up wins
/// when both markers are set
pub fn replica_intent(annotations: Option<&BTreeMap<String, String>>) -> ScaleIntent {
    let marked = |key: &str| {
        annotations
            .and_then(|a| a.get(key))
            .is_some_and(|v| v == MARKER_VALUE)
    };

    if marked(SCALE_UP_ANNOTATION) {
        ScaleIntent::Up
    } else if marked(SCALE_DOWN_ANNOTATION) {
        ScaleIntent::Down
    } else {
        ScaleIntent::Retain
    }
}

/// Desired replica count for one workload
pub fn desired_replicas(current: i32, intent: ScaleIntent, fallback: i32) -> i32 {
    match intent {
        ScaleIntent::Up => current.saturating_add(1),
        ScaleIntent::Down => current.saturating_sub(1).max(MIN_REPLICAS),
        ScaleIntent::Retain => fallback,
    }
}
