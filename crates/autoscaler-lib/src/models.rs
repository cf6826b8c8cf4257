//! Core data models for the autoscaler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Workload annotation that opts a workload into autoscaling
pub const ENABLED_ANNOTATION: &str = "autoscaler/enabled";

/// Pod-template annotation requesting one more replica
pub const SCALE_UP_ANNOTATION: &str = "autoscale.k8s.io/scale-up";

/// Pod-template annotation requesting one fewer replica
pub const SCALE_DOWN_ANNOTATION: &str = "autoscale.k8s.io/scale-down";

/// The only annotation value treated as set
pub const MARKER_VALUE: &str = "true";

/// A workload eligible for autoscaling, produced fresh each cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub namespace: String,
    pub workload_name: String,
    /// Storage claims referenced by the pod template, in declaration order
    pub storage_claim_names: Vec<String>,
}

/// A running pod belonging to a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

/// Single scalar result of one metrics query
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
}

/// What the decision engine wants done for one target identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingDecision {
    NoAction,
    ResizeStorage { target_size_bytes: i64 },
    ScaleReplicas { desired_count: i32 },
}

/// Per-workload scaling intent read from pod-template annotations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleIntent {
    Up,
    Down,
    Retain,
}

/// Result of applying a decision with bounded retries
#[derive(Debug)]
pub struct ActuationOutcome {
    pub succeeded: bool,
    pub attempts_used: u32,
    pub last_error: Option<crate::Error>,
}

impl ActuationOutcome {
    pub fn success(attempts_used: u32) -> Self {
        Self {
            succeeded: true,
            attempts_used,
            last_error: None,
        }
    }

    pub fn failure(attempts_used: u32, error: crate::Error) -> Self {
        Self {
            succeeded: false,
            attempts_used,
            last_error: Some(error),
        }
    }
}

/// Which corrective actions the loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub storage: bool,
    pub network: bool,
}

impl Mode {
    pub const STORAGE: Mode = Mode {
        storage: true,
        network: false,
    };
    pub const NETWORK: Mode = Mode {
        storage: false,
        network: true,
    };
    pub const BOTH: Mode = Mode {
        storage: true,
        network: true,
    };
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pvc" => Ok(Mode::STORAGE),
            "ingress" => Ok(Mode::NETWORK),
            "pvc,ingress" | "ingress,pvc" => Ok(Mode::BOTH),
            other => Err(format!(
                "invalid mode '{other}': expected 'pvc', 'ingress' or 'pvc,ingress'"
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.storage, self.network) {
            (true, true) => write!(f, "pvc,ingress"),
            (true, false) => write!(f, "pvc"),
            (false, true) => write!(f, "ingress"),
            (false, false) => write!(f, "none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("pvc".parse::<Mode>().unwrap(), Mode::STORAGE);
        assert_eq!("ingress".parse::<Mode>().unwrap(), Mode::NETWORK);
        assert_eq!("pvc,ingress".parse::<Mode>().unwrap(), Mode::BOTH);
        assert_eq!("ingress,pvc".parse::<Mode>().unwrap(), Mode::BOTH);
    }

    #[test]
    fn test_mode_rejects_unknown_values() {
        assert!("".parse::<Mode>().is_err());
        assert!("PVC".parse::<Mode>().is_err());
        assert!("pvc, ingress".parse::<Mode>().is_err());
        assert!("egress".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_display_round_trips() {
        for mode in [Mode::STORAGE, Mode::NETWORK, Mode::BOTH] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
    }
}
