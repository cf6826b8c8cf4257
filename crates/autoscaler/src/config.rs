//! Process settings
//!
//! These are the ambient knobs of the binary, read from `AUTOSCALER_*`
//! environment variables. The autoscaling policy itself lives in the
//! YAML file passed with `--config`.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSettings {
    /// Port for the health and metrics server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Kubeconfig context to use instead of the current one
    #[serde(default)]
    pub kube_context: Option<String>,
}

fn default_api_port() -> u16 {
    8080
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl RuntimeSettings {
    /// Load settings from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("AUTOSCALER").try_parsing(true))
    }

    fn from_source(source: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(source)
            .build()
            .context("failed to read AUTOSCALER_* settings")?;

        config
            .try_deserialize()
            .context("invalid AUTOSCALER_* settings")
    }
}
