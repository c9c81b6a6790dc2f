//! Error types for the load balancer core

use brivas_core::BrivasError;
use brivas_lb_health::HealthError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LbError>;

/// Fwmark pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FwmarkError {
    #[error("fwmark pool exhausted ({size} marks from {base})")]
    Exhausted { base: u32, size: u32 },

    #[error("no fwmark allocated for {0}")]
    UnknownKey(String),
}

#[derive(Error, Debug)]
pub enum LbError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    Validation(String),

    #[error("Balancer identity is immutable: {0}")]
    IdentityChange(String),

    #[error("Resolution failed for {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Fwmark error: {0}")]
    Fwmark(#[from] FwmarkError),

    #[error("IPVS error: {0}")]
    Ipvs(String),

    #[error("BGP error: {0}")]
    Bgp(String),

    #[error("Address table error: {0}")]
    Address(String),

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Data plane push failed: {0}")]
    Push(String),

    #[error("Data plane is shut down")]
    ShutDown,

    #[error("Health check setup failed: {0}")]
    Health(#[from] HealthError),
}

impl From<BrivasError> for LbError {
    fn from(err: BrivasError) -> Self {
        match err {
            BrivasError::Validation(msg) => LbError::Validation(msg),
            BrivasError::Config(msg) => LbError::Config(msg),
            BrivasError::Timeout(msg) => LbError::Timeout(msg),
            other => LbError::Push(other.to_string()),
        }
    }
}

impl From<LbError> for BrivasError {
    fn from(err: LbError) -> Self {
        match err {
            LbError::Config(msg) | LbError::Validation(msg) => BrivasError::Validation(msg),
            LbError::IdentityChange(msg) => BrivasError::Conflict(msg),
            LbError::ShutDown => BrivasError::Unavailable("data plane is shut down".into()),
            LbError::Timeout(msg) => BrivasError::Timeout(msg),
            LbError::Push(msg) => BrivasError::Network(msg),
            other => BrivasError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_mapping() {
        let err: BrivasError = LbError::ShutDown.into();
        assert_eq!(err.status_code(), 503);

        let err: BrivasError = LbError::IdentityChange("vip".into()).into();
        assert_eq!(err.status_code(), 409);

        let err: BrivasError = LbError::Ipvs("no such service".into()).into();
        assert_eq!(err.status_code(), 500);

        let back: LbError = BrivasError::Validation("dup".into()).into();
        assert!(matches!(back, LbError::Validation(_)));
    }
}
