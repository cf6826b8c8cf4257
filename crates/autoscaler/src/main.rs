//! Resource Autoscaler
//!
//! Runs the control loop that grows storage claims under disk pressure
//! and rescales workloads under ingress pressure, for every workload
//! annotated `autoscaler/enabled: "true"`.

use anyhow::{anyhow, Context, Result};
use autoscaler_lib::{
    health::HealthRegistry, AutoscalerConfig, AutoscalerMetrics, ControlLoop, KubeCluster, Mode,
    PrometheusGateway, Shutdown,
};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{LogFormat, RuntimeSettings};

/// Periodic storage and replica autoscaler driven by Prometheus metrics
#[derive(Parser, Debug)]
#[command(name = "resource-autoscaler")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Corrective actions to run: pvc, ingress or pvc,ingress
    #[arg(long, value_parser = parse_mode)]
    mode: Mode,

    /// Autoscaler policy file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to kubeconfig file (in-cluster or ~/.kube/config if not specified)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

fn parse_mode(raw: &str) -> std::result::Result<Mode, String> {
    raw.parse()
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Wait for a shutdown signal while watching the API server task.
///
/// Returns `Ok` once the signal arrives. The server is expected to run
/// until then, so its early exit (for example a port that cannot be
/// bound) is logged and returned as an error.
async fn wait_for_exit(
    api_handle: &mut JoinHandle<Result<()>>,
    signal: impl Future<Output = Result<()>>,
) -> Result<()> {
    tokio::select! {
        result = signal => {
            result.context("failed to listen for shutdown signals")?;
            info!("Shutdown signal received");
            Ok(())
        }
        joined = api_handle => {
            let err = match joined {
                Ok(Ok(())) => anyhow!("API server stopped unexpectedly"),
                Ok(Err(e)) => e.context("API server failed"),
                Err(e) => anyhow!(e).context("API server task panicked"),
            };
            let message = format!("{err:#}");
            error!(error = %message, "API server is down; shutting down");
            Err(err)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = RuntimeSettings::load()?;
    init_tracing(settings.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %cli.mode,
        "Starting resource-autoscaler"
    );

    let policy = AutoscalerConfig::load(&cli.config)
        .with_context(|| format!("failed to load policy from {}", cli.config.display()))?;
    info!(
        interval_minutes = policy.interval,
        prometheus = %policy.prometheus.url,
        "Policy loaded"
    );

    let cluster = KubeCluster::connect(cli.kubeconfig.as_deref(), settings.kube_context.as_deref())
        .await
        .context("failed to create Kubernetes client")?;
    let gateway = PrometheusGateway::new(&policy.prometheus.url, policy.query_templates())
        .context("failed to create Prometheus client")?;

    let health_registry = HealthRegistry::for_control_loop().await;
    // Register collectors before the first scrape
    let _metrics = AutoscalerMetrics::new();

    let control = ControlLoop::builder()
        .cluster(Arc::new(cluster))
        .gateway(Arc::new(gateway))
        .mode(cli.mode)
        .settings(policy.loop_settings())
        .health(health_registry.clone())
        .build()?;

    if cli.once {
        let report = control.run_cycle(&Shutdown::never()).await?;
        info!(
            targets = report.targets,
            storage_resizes = report.storage_resizes,
            replica_updates = report.replica_updates,
            fetch_failures = report.fetch_failures,
            "Single cycle finished"
        );
        return Ok(());
    }

    let app_state = Arc::new(api::AppState::new(health_registry));
    let mut api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    let (trigger, shutdown) = Shutdown::channel();
    let loop_handle = tokio::spawn(control.run(shutdown));

    let exit = wait_for_exit(&mut api_handle, shutdown_signal()).await;
    trigger.trigger();

    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Control loop task ended abnormally");
    }
    api_handle.abort();

    info!("Shut down");
    exit
}
