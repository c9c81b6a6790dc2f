//! Balancer State Machine
//!
//! One task per logical service. Health reports, reconfiguration and the
//! resolution retry timer are all handled on the balancer's own loop, so
//! the published snapshot needs no locking beyond the atomic swap.
//!
//! A round is published only when every discovered host resolved; a
//! failed round keeps the previous snapshot and schedules one retry.

use arc_swap::ArcSwapOption;
use brivas_core::{AddressFamily, BalancerState, DynamicRoute, ServiceKey, UpstreamState};
use brivas_lb_health::{
    build_checker, build_discovery, DiscoveryResolver, HealthChecker, HealthManager, HealthReport,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BalancerConfig, BalancerId};
use crate::error::{LbError, Result};
use crate::fwmark::FwmarkAllocator;
use crate::modules::ResolverModule;

const REPORT_BUFFER: usize = 4;
const UPDATE_BUFFER: usize = 8;

/// Everything the reconciler learns from one balancer
#[derive(Debug, Clone, Serialize)]
pub struct BalancerSnapshot {
    pub state: BalancerState,
    /// Per-real fwmark services
    pub mirrors: Vec<BalancerState>,
    pub route: Option<DynamicRoute>,
    pub alive_ratio: f64,
    /// True until the first round with a healthy upstream
    pub initial_state: bool,
    pub failsafe: bool,
    pub upstream_count: usize,
    pub announce_limit_ratio: f64,
    pub published_at: DateTime<Utc>,
}

impl BalancerSnapshot {
    /// Whether the configured route may be announced
    pub fn admits_route(&self) -> bool {
        !self.initial_state && self.alive_ratio > 0.0 && self.alive_ratio >= self.announce_limit_ratio
    }
}

/// Shared with every balancer of one reconciler
#[derive(Clone)]
pub struct BalancerContext {
    pub resolver: Arc<dyn ResolverModule>,
    pub fwmarks: Arc<FwmarkAllocator>,
    /// Single-slot wake-up of the reconciler
    pub notify: mpsc::Sender<()>,
}

struct Update {
    config: BalancerConfig,
    discovery: Arc<dyn DiscoveryResolver>,
    checker: Arc<dyn HealthChecker>,
}

/// Handle to a running balancer
pub struct Balancer {
    id: BalancerId,
    setup_name: String,
    config: RwLock<BalancerConfig>,
    snapshot: Arc<ArcSwapOption<BalancerSnapshot>>,
    updates: mpsc::Sender<Update>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Balancer {
    pub fn spawn(config: BalancerConfig, ctx: BalancerContext, cancel: CancellationToken) -> Result<Self> {
        let discovery = build_discovery(&config.discovery, config.port)?;
        let checker = build_checker(&config.health_check.check)?;

        let id = config.id();
        let snapshot = Arc::new(ArcSwapOption::empty());
        let (updates, updates_rx) = mpsc::channel(UPDATE_BUFFER);

        let worker = Worker {
            id: id.clone(),
            config: config.clone(),
            ctx,
            snapshot: snapshot.clone(),
            cancel: cancel.clone(),
            latest: None,
            initial_state: true,
            failsafe: false,
            marks: HashMap::new(),
            retry_at: None,
        };
        let handle = tokio::spawn(worker.run(updates_rx, discovery, checker));
        info!(balancer = %id, "Balancer started");

        Ok(Self {
            id,
            setup_name: config.setup_name.clone(),
            config: RwLock::new(config),
            snapshot,
            updates,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> &BalancerId {
        &self.id
    }

    pub fn config(&self) -> BalancerConfig {
        self.config.read().clone()
    }

    /// Latest published snapshot; `None` until the first publish
    pub fn snapshot(&self) -> Option<Arc<BalancerSnapshot>> {
        self.snapshot.load_full()
    }

    /// Reconfigure in place. Identity changes are rejected before anything
    /// is touched.
    pub async fn update(&self, config: BalancerConfig) -> Result<()> {
        if config.id() != self.id || config.setup_name != self.setup_name {
            return Err(LbError::IdentityChange(format!(
                "{} (setup {:?}) cannot become {} (setup {:?})",
                self.id,
                self.setup_name,
                config.id(),
                config.setup_name
            )));
        }

        let discovery = build_discovery(&config.discovery, config.port)?;
        let checker = build_checker(&config.health_check.check)?;

        self.updates
            .send(Update {
                config: config.clone(),
                discovery,
                checker,
            })
            .await
            .map_err(|_| LbError::Config(format!("balancer {} is stopped", self.id)))?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait until its resources are released
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct Worker {
    id: BalancerId,
    config: BalancerConfig,
    ctx: BalancerContext,
    snapshot: Arc<ArcSwapOption<BalancerSnapshot>>,
    cancel: CancellationToken,
    latest: Option<HealthReport>,
    initial_state: bool,
    failsafe: bool,
    /// Fwmark keys this balancer holds a reference on
    marks: HashMap<String, u32>,
    retry_at: Option<Instant>,
}

impl Worker {
    async fn run(
        mut self,
        mut updates: mpsc::Receiver<Update>,
        discovery: Arc<dyn DiscoveryResolver>,
        checker: Arc<dyn HealthChecker>,
    ) {
        let (mut health, mut reports) = self.start_health(discovery, checker);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(report) = reports.recv() => {
                    self.latest = Some(report);
                    self.evaluate().await;
                }
                Some(update) = updates.recv() => {
                    let restart = update.config.discovery != self.config.discovery
                        || update.config.health_check != self.config.health_check;
                    self.config = update.config;
                    info!(balancer = %self.id, restart_health = restart, "Balancer reconfigured");

                    if restart {
                        health.stop().await;
                        (health, reports) = self.start_health(update.discovery, update.checker);
                    }
                    self.evaluate().await;
                }
                _ = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    debug!(balancer = %self.id, "Retrying state build");
                    self.evaluate().await;
                }
            }
        }

        health.stop().await;
        for (key, _) in self.marks.drain() {
            if let Err(e) = self.ctx.fwmarks.release(&key) {
                warn!(balancer = %self.id, key = %key, error = %e, "Failed to release fwmark");
            }
        }
        info!(balancer = %self.id, "Balancer stopped");
    }

    fn start_health(
        &self,
        discovery: Arc<dyn DiscoveryResolver>,
        checker: Arc<dyn HealthChecker>,
    ) -> (HealthManager, mpsc::Receiver<HealthReport>) {
        let (tx, rx) = mpsc::channel(REPORT_BUFFER);
        let manager = HealthManager::spawn(
            self.id.to_string(),
            self.config.health_check.clone(),
            discovery,
            checker,
            tx,
            self.cancel.child_token(),
        );
        (manager, rx)
    }

    /// Rebuild from the latest report and publish, or schedule a retry
    async fn evaluate(&mut self) {
        let Some(report) = self.latest.clone() else {
            return;
        };

        match self.resolve(&report).await {
            Ok(upstreams) => {
                self.retry_at = None;
                let snapshot = self.build(upstreams);
                self.publish(snapshot);
            }
            Err(e) => {
                if self.retry_at.is_none() {
                    let delay = self.config.retry_delay();
                    self.retry_at = Some(Instant::now() + delay);
                    warn!(
                        balancer = %self.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Resolution failed, keeping previous snapshot"
                    );
                } else {
                    debug!(balancer = %self.id, error = %e, "Resolution failed, retry already pending");
                }
            }
        }
    }

    /// Resolve every reported target; any failure fails the round.
    /// Targets resolving to the same address and port collapse, last wins.
    async fn resolve(&self, report: &HealthReport) -> Result<Vec<UpstreamState>> {
        let family = self.config.family();
        let lookups = report
            .targets
            .iter()
            .map(|t| self.ctx.resolver.lookup(&t.target.host, family));
        let addresses = join_all(lookups).await;

        let mut upstreams: Vec<UpstreamState> = Vec::with_capacity(report.targets.len());
        let mut index: HashMap<SocketAddr, usize> = HashMap::new();
        for (health, address) in report.targets.iter().zip(addresses) {
            let upstream = UpstreamState {
                hostname: health.target.host.clone(),
                address: address?,
                port: health.target.port,
                weight: if health.healthy { self.config.weight_up } else { 0 },
                forward_method: self.config.forward_method,
            };
            match index.get(&upstream.key()) {
                Some(&i) => upstreams[i] = upstream,
                None => {
                    index.insert(upstream.key(), upstreams.len());
                    upstreams.push(upstream);
                }
            }
        }
        Ok(upstreams)
    }

    fn build(&mut self, mut upstreams: Vec<UpstreamState>) -> BalancerSnapshot {
        let total = upstreams.len();
        let healthy = upstreams.iter().filter(|u| u.is_up()).count();
        let alive_ratio = if total == 0 {
            0.0
        } else {
            healthy as f64 / total as f64
        };

        if self.initial_state && alive_ratio > 0.0 {
            self.initial_state = false;
            info!(balancer = %self.id, healthy, total, "First healthy round, failsafe armed");
        }

        let failsafe = !self.initial_state && healthy == 0 && total > 0;
        if failsafe {
            for upstream in &mut upstreams {
                upstream.weight = self.config.weight_up;
            }
        }
        if failsafe != self.failsafe {
            if failsafe {
                warn!(balancer = %self.id, total, "All upstreams down, failsafe keeps every upstream in rotation");
            } else {
                info!(balancer = %self.id, healthy, total, "Failsafe released");
            }
            self.failsafe = failsafe;
        }

        let state = BalancerState {
            name: self.config.name.clone(),
            key: self.config.service_key(),
            scheduler: self.config.scheduler.clone(),
            upstreams,
        };
        let mirrors = self.mirrors(&state);

        BalancerSnapshot {
            route: self.config.route(),
            mirrors,
            alive_ratio,
            initial_state: self.initial_state,
            failsafe,
            upstream_count: total,
            announce_limit_ratio: self.config.announce_limit_ratio,
            published_at: Utc::now(),
            state,
        }
    }

    /// Fwmark services for every real server; marks of reals that went
    /// away are released
    fn mirrors(&mut self, state: &BalancerState) -> Vec<BalancerState> {
        let mut wanted: Vec<(String, &UpstreamState)> = Vec::new();
        if self.config.fwmark {
            for upstream in &state.upstreams {
                let key = format!("{}/{}", self.config.vip, upstream.address);
                if !wanted.iter().any(|(k, _)| *k == key) {
                    wanted.push((key, upstream));
                }
            }
        }

        let stale: Vec<String> = self
            .marks
            .keys()
            .filter(|k| !wanted.iter().any(|(w, _)| w == *k))
            .cloned()
            .collect();
        for key in stale {
            self.marks.remove(&key);
            if let Err(e) = self.ctx.fwmarks.release(&key) {
                warn!(balancer = %self.id, key = %key, error = %e, "Failed to release fwmark");
            }
        }

        let mut mirrors = Vec::with_capacity(wanted.len());
        for (key, upstream) in wanted {
            let mark = match self.marks.get(&key) {
                Some(mark) => *mark,
                None => match self.ctx.fwmarks.allocate(&key) {
                    Ok(mark) => {
                        self.marks.insert(key.clone(), mark);
                        mark
                    }
                    Err(e) => {
                        warn!(balancer = %self.id, key = %key, error = %e, "Skipping fwmark service");
                        continue;
                    }
                },
            };

            mirrors.push(BalancerState {
                name: format!("{}:{}", state.name, upstream.hostname),
                key: ServiceKey::Fwmark {
                    mark,
                    family: AddressFamily::of(&upstream.address),
                },
                scheduler: state.scheduler.clone(),
                upstreams: vec![UpstreamState {
                    hostname: upstream.hostname.clone(),
                    address: upstream.address,
                    port: 0,
                    weight: self.config.weight_up,
                    forward_method: self.config.forward_method,
                }],
            });
        }
        mirrors
    }

    fn publish(&self, snapshot: BalancerSnapshot) {
        debug!(
            balancer = %self.id,
            alive_ratio = snapshot.alive_ratio,
            upstreams = snapshot.upstream_count,
            mirrors = snapshot.mirrors.len(),
            "Publishing balancer snapshot"
        );
        self.snapshot.store(Some(Arc::new(snapshot)));

        match self.ctx.notify.try_send(()) {
            // A pending wake-up already covers this snapshot
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => {
                debug!(balancer = %self.id, "Reconciler gone, snapshot not announced");
            }
        }
    }
}
