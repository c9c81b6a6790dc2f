//! Environment settings of the data plane

use brivas_core::config::{env_flag, env_u64};
use brivas_core::{BrivasError, Result};
use brivas_lb::modules::command::DEFAULT_COMMAND_TIMEOUT;
use brivas_lb::modules::gobgp::DEFAULT_HOLD_TIME;
use std::net::IpAddr;
use std::time::Duration;

/// What to do with the kernel and BGP state on exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Withdraw routes, then remove services and addresses
    Flush,
    /// Leave everything for the next instance
    Keep,
}

impl ShutdownMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "flush" => Ok(Self::Flush),
            "keep" => Ok(Self::Keep),
            other => Err(BrivasError::Config(format!(
                "Invalid LB_SHUTDOWN_MODE {:?}, expected flush or keep",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataPlaneSettings {
    pub cluster: String,
    /// Interface VIPs are listed from
    pub interface: String,
    pub router_id: IpAddr,
    /// In-memory collaborators instead of ipvsadm/ip/gobgp
    pub dry_run: bool,
    pub command_timeout: Duration,
    /// Withdraw wait for routes announced before a restart
    pub bgp_hold_time: Duration,
    pub shutdown_mode: ShutdownMode,
}

impl DataPlaneSettings {
    pub fn from_env() -> Result<Self> {
        let router_id = std::env::var("BGP_ROUTER_ID").unwrap_or_else(|_| "127.0.0.1".to_string());
        let router_id = router_id
            .parse()
            .map_err(|e| BrivasError::Config(format!("Invalid BGP_ROUTER_ID: {}", e)))?;

        let shutdown_mode = match std::env::var("LB_SHUTDOWN_MODE") {
            Ok(raw) => ShutdownMode::parse(&raw)?,
            Err(_) => ShutdownMode::Flush,
        };

        Ok(Self {
            cluster: std::env::var("LB_CLUSTER").unwrap_or_else(|_| "default".to_string()),
            interface: std::env::var("LB_INTERFACE").unwrap_or_else(|_| "lo".to_string()),
            router_id,
            dry_run: env_flag("LB_DRY_RUN", false),
            command_timeout: Duration::from_millis(env_u64(
                "LB_COMMAND_TIMEOUT_MS",
                DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            )?),
            bgp_hold_time: Duration::from_millis(env_u64(
                "LB_BGP_HOLD_TIME_MS",
                DEFAULT_HOLD_TIME.as_millis() as u64,
            )?),
            shutdown_mode,
        })
    }
}
