//! Transport between the control plane and the data plane

use async_trait::async_trait;
use brivas_core::DataPlaneState;
use std::time::Duration;
use tracing::debug;

use crate::dataplane::DataPlaneManager;
use crate::error::{LbError, Result};

/// Path the data plane accepts desired states on
pub const STATE_PATH: &str = "/api/v1/state";

#[async_trait]
pub trait DataPlaneClient: Send + Sync {
    /// Hand over a complete desired state
    async fn set(&self, state: &DataPlaneState) -> Result<()>;
}

/// Control plane and data plane in the same process
#[async_trait]
impl DataPlaneClient for DataPlaneManager {
    async fn set(&self, state: &DataPlaneState) -> Result<()> {
        self.set_state(state).await
    }
}

/// Pushes states to a remote data plane over HTTP
pub struct HttpDataPlaneClient {
    http: reqwest::Client,
    url: String,
}

impl HttpDataPlaneClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LbError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            url: format!("{}{}", base_url.trim_end_matches('/'), STATE_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DataPlaneClient for HttpDataPlaneClient {
    async fn set(&self, state: &DataPlaneState) -> Result<()> {
        let response = self
            .http
            .put(&self.url)
            .json(state)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LbError::Timeout(format!("PUT {}", self.url))
                } else {
                    LbError::Push(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LbError::Push(format!("{} returned {}: {}", self.url, status, body)));
        }
        debug!(url = %self.url, services = state.balancers.len(), "State accepted");
        Ok(())
    }
}
