//! Configuration management for microservices

use crate::error::{BrivasError, Result};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub http_bind: String,
    pub log_level: String,
    pub enable_telemetry: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let http_bind = env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        http_bind
            .parse::<std::net::SocketAddr>()
            .map_err(|e| BrivasError::Config(format!("Invalid HTTP_BIND: {}", e)))?;

        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "unknown".to_string()),
            http_bind,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            enable_telemetry: env::var("ENABLE_TELEMETRY")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }
}

/// Read an optional numeric environment variable, falling back to `default`
/// when unset.
pub fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| BrivasError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

/// Read a boolean flag ("true"/"1" enable it).
pub fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}
