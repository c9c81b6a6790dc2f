//! Health checking types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    2000
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_threshold() -> u32 {
    1
}

/// A real server candidate produced by discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

pub(crate) fn authority(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Probe definition, one variant per protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckConfig {
    /// Always healthy
    Dummy,
    Tcp {
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Http {
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
        /// Host header override
        #[serde(default)]
        host: Option<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Dns {
        query: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Syslog {
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::Tcp {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl HealthCheckConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dummy => "dummy",
            Self::Tcp { .. } => "tcp",
            Self::Http { .. } => "http",
            Self::Dns { .. } => "dns",
            Self::Syslog { .. } => "syslog",
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Dummy => Duration::ZERO,
            Self::Tcp { timeout_ms }
            | Self::Http { timeout_ms, .. }
            | Self::Dns { timeout_ms, .. }
            | Self::Syslog { timeout_ms } => Duration::from_millis(*timeout_ms),
        }
    }
}

/// Scheduling of the probes for one balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive successes before a down target is marked up
    #[serde(default = "default_threshold")]
    pub rise: u32,
    /// Consecutive failures before an up target is marked down
    #[serde(default = "default_threshold")]
    pub fall: u32,
    #[serde(default)]
    pub check: HealthCheckConfig,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            rise: default_threshold(),
            fall: default_threshold(),
            check: HealthCheckConfig::default(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Health of one discovered target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHealth {
    pub target: Target,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub latency_ms: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// One complete probe round, delivered to the balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub targets: Vec<TargetHealth>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn total(&self) -> usize {
        self.targets.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.targets.iter().filter(|t| t.healthy).count()
    }
}

/// Health check errors
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unhealthy: {0}")]
    Unhealthy(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
