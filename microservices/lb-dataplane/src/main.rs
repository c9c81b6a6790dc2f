//! LB Data Plane - Kernel LB, BGP and VIP Convergence
//!
//! Accepts complete desired states from the control plane and converges
//! the local IPVS table, BGP announcements and VIP addresses onto them.

use brivas_core::{BrivasService, HealthStatus, MicroserviceRuntime, ReadinessStatus, Result, ServiceConfig};
use brivas_lb::modules::{CachingResolver, DataPlaneModules, GoBgp, IpRoute2, IpvsAdm, MemoryDataPlane};
use brivas_lb::{DataPlaneManager, KeepState, ShutdownHandler, WithdrawAndFlush};
use brivas_telemetry::MetricsRegistry;
use std::sync::Arc;
use tracing::{info, warn};

mod api;
mod settings;

use settings::{DataPlaneSettings, ShutdownMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _telemetry = brivas_telemetry::init("lb-dataplane")?;

    info!("Starting LB Data Plane");

    let service = Arc::new(DataPlaneService::new(DataPlaneSettings::from_env()?));
    MicroserviceRuntime::run(service).await?;
    Ok(())
}

pub struct DataPlaneService {
    settings: DataPlaneSettings,
    manager: Arc<DataPlaneManager>,
    metrics: MetricsRegistry,
    start_time: std::time::Instant,
}

impl DataPlaneService {
    pub fn new(settings: DataPlaneSettings) -> Self {
        let modules = if settings.dry_run {
            warn!("Dry run: kernel, BGP and addresses are simulated in memory");
            MemoryDataPlane::new(&settings.cluster).modules()
        } else {
            DataPlaneModules {
                ipvs: Arc::new(IpvsAdm::new(settings.command_timeout)),
                bgp: Arc::new(
                    GoBgp::new(settings.router_id, settings.command_timeout)
                        .with_default_hold_time(settings.bgp_hold_time),
                ),
                addresses: Arc::new(IpRoute2::new(settings.interface.clone(), settings.command_timeout)),
                resolver: Arc::new(CachingResolver::new(settings.cluster.clone())),
            }
        };

        let shutdown_handler: Arc<dyn ShutdownHandler> = match settings.shutdown_mode {
            ShutdownMode::Flush => Arc::new(WithdrawAndFlush),
            ShutdownMode::Keep => Arc::new(KeepState),
        };

        let metrics = MetricsRegistry::new();
        Self {
            manager: Arc::new(DataPlaneManager::new(modules, shutdown_handler, metrics.clone())),
            settings,
            metrics,
            start_time: std::time::Instant::now(),
        }
    }
}

#[async_trait::async_trait]
impl BrivasService for DataPlaneService {
    fn service_id(&self) -> &'static str {
        "lb-dataplane"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        api::readiness(&self.manager).await
    }

    async fn shutdown(&self) -> Result<()> {
        info!(mode = ?self.settings.shutdown_mode, "Shutting down LB Data Plane");
        self.manager.shutdown().await?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let http_bind = ServiceConfig::from_env()?.http_bind;
        info!(
            bind = %http_bind,
            interface = %self.settings.interface,
            dry_run = self.settings.dry_run,
            "Starting LB Data Plane"
        );

        let app = api::router(api::AppState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
        });

        let listener = tokio::net::TcpListener::bind(&http_bind).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
