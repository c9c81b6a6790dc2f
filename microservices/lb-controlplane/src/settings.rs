//! Environment settings of the control plane

use brivas_core::config::env_u64;
use brivas_core::{BrivasError, Result};
use brivas_lb::ControlPlaneConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/brivas/lb.json";

#[derive(Debug, Clone)]
pub struct ControlPlaneSettings {
    pub config_path: PathBuf,
    /// Remote data plane; in-process dry run when unset
    pub dataplane_url: Option<String>,
    pub dataplane_timeout: Duration,
}

impl ControlPlaneSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            config_path: std::env::var("LB_CONFIG_PATH")
                .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
                .into(),
            dataplane_url: std::env::var("DATAPLANE_URL").ok().filter(|v| !v.is_empty()),
            dataplane_timeout: Duration::from_millis(env_u64("DATAPLANE_TIMEOUT_MS", 5000)?),
        })
    }
}

/// Read and validate the balancer configuration file
pub async fn load_config(path: &Path) -> Result<ControlPlaneConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| BrivasError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    let config = ControlPlaneConfig::from_json(&raw)?;
    config.validate()?;
    Ok(config)
}
