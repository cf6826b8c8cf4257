//! Poll-until-ready waits for mutated resources
//!
//! A wait ends in exactly one of three terminal states: the resource became
//! ready, the deadline passed, or the wait was aborted by a read failure or
//! by shutdown. Nothing is retried after a terminal state.

use crate::cluster::ClusterClient;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Phase a storage claim reports once it is usable
pub const CLAIM_BOUND_PHASE: &str = "Bound";

/// Poll cadence and deadline for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub enum AbortReason {
    /// Reading the resource failed; the error is not retried
    Read(Error),
    Cancelled,
}

#[derive(Debug)]
pub enum WaitOutcome {
    Ready,
    TimedOut { elapsed: Duration },
    Aborted(AbortReason),
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready)
    }

    /// Collapse into a `Result`, naming the resource in the error
    pub fn into_result(self, resource: &str) -> Result<()> {
        match self {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::TimedOut { elapsed } => Err(Error::ConvergenceTimeout {
                resource: resource.to_string(),
                waited: elapsed,
            }),
            WaitOutcome::Aborted(AbortReason::Read(err)) => Err(Error::ConvergenceAborted {
                resource: resource.to_string(),
                reason: err.to_string(),
            }),
            WaitOutcome::Aborted(AbortReason::Cancelled) => Err(Error::ConvergenceAborted {
                resource: resource.to_string(),
                reason: "shutdown requested".to_string(),
            }),
        }
    }
}

/// Probe `check` every poll interval until it reports ready, fails, or the
/// deadline passes. The first probe runs one interval after the start and
/// the last one runs at the deadline.
pub async fn poll_until<F, Fut>(settings: WaitSettings, shutdown: &Shutdown, mut check: F) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let deadline = start + settings.timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !shutdown.sleep(settings.poll_interval.min(remaining)).await {
            return WaitOutcome::Aborted(AbortReason::Cancelled);
        }

        match check().await {
            Ok(true) => return WaitOutcome::Ready,
            Ok(false) => {}
            Err(err) => return WaitOutcome::Aborted(AbortReason::Read(err)),
        }

        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut {
                elapsed: start.elapsed(),
            };
        }
    }
}

/// Waits on storage claims and workloads through the cluster client
pub struct ConvergenceWaiter {
    cluster: Arc<dyn ClusterClient>,
    settings: WaitSettings,
}

impl ConvergenceWaiter {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: WaitSettings) -> Self {
        Self { cluster, settings }
    }

    /// Wait for a claim's phase to become `Bound`
    pub async fn wait_for_claim_bound(
        &self,
        namespace: &str,
        claim_name: &str,
        shutdown: &Shutdown,
    ) -> WaitOutcome {
        let cluster = &self.cluster;
        poll_until(self.settings, shutdown, move || async move {
            let claim = cluster
                .get_claim(namespace, claim_name)
                .await
                .map_err(|e| Error::from_read("PersistentVolumeClaim", namespace, claim_name, e))?;
            let phase = claim.status.and_then(|s| s.phase);
            debug!(namespace, claim = claim_name, phase = ?phase, "Polled claim phase");
            Ok::<_, Error>(phase.as_deref() == Some(CLAIM_BOUND_PHASE))
        })
        .await
    }

    /// Wait for a workload to report `desired` ready replicas
    pub async fn wait_for_ready_replicas(
        &self,
        namespace: &str,
        workload: &str,
        desired: i32,
        shutdown: &Shutdown,
    ) -> WaitOutcome {
        let cluster = &self.cluster;
        poll_until(self.settings, shutdown, move || async move {
            let deployment = cluster
                .get_deployment(namespace, workload)
                .await
                .map_err(|e| Error::from_read("Deployment", namespace, workload, e))?;
            let ready = deployment
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            debug!(namespace, workload, ready, desired, "Polled ready replicas");
            Ok::<_, Error>(ready == desired)
        })
        .await
    }
}
