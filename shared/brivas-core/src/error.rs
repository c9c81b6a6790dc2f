//! Error types for Brivas services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrivasError>;

#[derive(Error, Debug)]
pub enum BrivasError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl BrivasError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Unavailable(_) => 503,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Timeout(_) => "TIMEOUT",
        }
    }
}

impl From<std::io::Error> for BrivasError {
    fn from(err: std::io::Error) -> Self {
        BrivasError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for BrivasError {
    fn from(err: serde_json::Error) -> Self {
        BrivasError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BrivasError::Validation("bad vip".into()).status_code(), 400);
        assert_eq!(BrivasError::Unavailable("shut down".into()).status_code(), 503);
        assert_eq!(BrivasError::Internal("ipvsadm".into()).status_code(), 500);
        assert_eq!(BrivasError::Conflict("x".into()).error_code(), "CONFLICT");
    }
}
