//! LB Control Plane - Balancer Reconciliation
//!
//! Runs one balancer per configured service, tracks upstream health and
//! pushes the assembled state to the data plane.

use brivas_core::{
    BrivasService, DependencyStatus, HealthStatus, MicroserviceRuntime, ReadinessStatus, Result,
    ServiceConfig,
};
use brivas_lb::modules::{CachingResolver, DataPlaneModules, MemoryDataPlane, ResolverModule};
use brivas_lb::{
    ControlPlaneConfig, ControlPlaneReconciler, DataPlaneClient, DataPlaneManager,
    HttpDataPlaneClient, ReconcilerContext, WithdrawAndFlush,
};
use brivas_telemetry::MetricsRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod settings;

use settings::{load_config, ControlPlaneSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _telemetry = brivas_telemetry::init("lb-controlplane")?;

    info!("Starting LB Control Plane");

    let settings = ControlPlaneSettings::from_env()?;
    let config = load_config(&settings.config_path).await?;
    let service = Arc::new(ControlPlaneService::new(settings, config)?);
    MicroserviceRuntime::run(service).await?;
    Ok(())
}

pub struct ControlPlaneService {
    settings: ControlPlaneSettings,
    reconciler: Arc<ControlPlaneReconciler>,
    ready: Arc<AtomicBool>,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
    start_time: std::time::Instant,
}

impl ControlPlaneService {
    pub fn new(settings: ControlPlaneSettings, config: ControlPlaneConfig) -> Result<Self> {
        let metrics = MetricsRegistry::new();
        let resolver: Arc<dyn ResolverModule> = Arc::new(CachingResolver::new(config.cluster.clone()));

        let client: Arc<dyn DataPlaneClient> = match &settings.dataplane_url {
            Some(url) => {
                info!(url = %url, "Pushing state to remote data plane");
                Arc::new(HttpDataPlaneClient::new(url, settings.dataplane_timeout)?)
            }
            None => {
                warn!("DATAPLANE_URL not set, using an in-process simulated data plane");
                let plane = MemoryDataPlane::new(&config.cluster);
                let modules = DataPlaneModules {
                    resolver: resolver.clone(),
                    ..plane.modules()
                };
                Arc::new(DataPlaneManager::new(modules, Arc::new(WithdrawAndFlush), metrics.clone()))
            }
        };

        let ready = Arc::new(AtomicBool::new(false));
        let fired = ready.clone();
        let cancel = CancellationToken::new();
        let reconciler = ControlPlaneReconciler::start(
            config,
            ReconcilerContext {
                client,
                resolver,
                metrics: metrics.clone(),
            },
            Some(Box::new(move || {
                fired.store(true, Ordering::Release);
                info!("Every balancer reported, control plane ready");
            })),
            cancel.child_token(),
        )?;

        Ok(Self {
            settings,
            reconciler: Arc::new(reconciler),
            ready,
            metrics,
            cancel,
            start_time: std::time::Instant::now(),
        })
    }
}

#[async_trait::async_trait]
impl BrivasService for ControlPlaneService {
    fn service_id(&self) -> &'static str {
        "lb-controlplane"
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
        let ready = self.ready.load(Ordering::Acquire);
        ReadinessStatus {
            ready,
            dependencies: vec![DependencyStatus {
                name: match &self.settings.dataplane_url {
                    Some(url) => format!("dataplane:{}", url),
                    None => "dataplane:in-process".to_string(),
                },
                available: ready,
                latency_ms: None,
            }],
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down LB Control Plane");
        self.cancel.cancel();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let http_bind = ServiceConfig::from_env()?.http_bind;
        info!(
            bind = %http_bind,
            config = %self.settings.config_path.display(),
            "Starting LB Control Plane"
        );

        let app = api::router(api::AppState {
            reconciler: self.reconciler.clone(),
            config_path: self.settings.config_path.clone(),
            ready: self.ready.clone(),
            metrics: self.metrics.clone(),
        });

        let listener = tokio::net::TcpListener::bind(&http_bind).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
