//! Control Plane Reconciler
//!
//! Owns one balancer per configured service and turns their snapshots into
//! the full data plane state. Config reloads, the periodic resync and the
//! balancers' wake-ups are all served by one loop; the state is rebuilt
//! from scratch every time and pushed through a [`DataPlaneClient`].

use arc_swap::ArcSwapOption;
use brivas_core::{BalancerState, DataPlaneState, DynamicRoute, LinkAddress, ServiceKey};
use brivas_telemetry::MetricsRegistry;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::balancer::{Balancer, BalancerContext, BalancerSnapshot};
use crate::client::DataPlaneClient;
use crate::comparator::compare;
use crate::config::{BalancerConfig, BalancerId, ControlPlaneConfig};
use crate::error::{LbError, Result};
use crate::fwmark::FwmarkAllocator;
use crate::modules::ResolverModule;

/// Called once, after the first push covering every balancer
pub type AfterInit = Box<dyn FnOnce() + Send + 'static>;

/// Final route set: admitted routes minus anything covered by a prohibited
/// prefix, identical prefixes collapsed to the first
pub fn filter_routes(allowed: Vec<DynamicRoute>, prohibited: &[DynamicRoute]) -> Vec<DynamicRoute> {
    let mut seen = HashSet::new();
    allowed
        .into_iter()
        .filter(|route| !prohibited.iter().any(|p| p.prefix.contains(&route.prefix)))
        .filter(|route| seen.insert(route.prefix))
        .collect()
}

/// Assemble the data plane state from one snapshot per configured balancer,
/// in configuration order
pub fn build_state(config: &ControlPlaneConfig, snapshots: &[Arc<BalancerSnapshot>]) -> DataPlaneState {
    let mut balancers: Vec<BalancerState> = Vec::with_capacity(snapshots.len());
    let mut mirror_keys: HashSet<ServiceKey> = HashSet::new();
    let mut mirrors: Vec<BalancerState> = Vec::new();
    let mut allowed = Vec::new();
    let mut prohibited = Vec::new();
    let mut vips = Vec::new();

    for snapshot in snapshots {
        balancers.push(snapshot.state.clone());

        // Balancers sharing a VIP share marks; the first copy wins
        for mirror in &snapshot.mirrors {
            if mirror_keys.insert(mirror.key) {
                mirrors.push(mirror.clone());
            }
        }

        if let Some(route) = &snapshot.route {
            if snapshot.admits_route() {
                allowed.push(route.clone());
            } else {
                prohibited.push(route.clone());
            }
        }

        if let Some(vip) = snapshot.state.key.vip() {
            if !vips.contains(&vip) {
                vips.push(vip);
            }
        }
    }

    balancers.extend(mirrors);

    DataPlaneState {
        balancers,
        dynamic_routes: filter_routes(allowed, &prohibited),
        link_addresses: vips
            .into_iter()
            .map(|address| LinkAddress {
                interface: config.link_interface.clone(),
                address,
            })
            .collect(),
    }
}

enum Command {
    Reload {
        config: ControlPlaneConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Sync,
}

/// Dependencies injected into the reconciler
#[derive(Clone)]
pub struct ReconcilerContext {
    pub client: Arc<dyn DataPlaneClient>,
    pub resolver: Arc<dyn ResolverModule>,
    pub metrics: MetricsRegistry,
}

struct Shared {
    config: RwLock<ControlPlaneConfig>,
    last_state: ArcSwapOption<DataPlaneState>,
    snapshots: ArcSwapOption<Vec<Arc<BalancerSnapshot>>>,
    initialized: AtomicBool,
}

/// Handle to the running control plane
pub struct ControlPlaneReconciler {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ControlPlaneReconciler {
    /// Validate `config`, start its balancers and the reconcile loop
    pub fn start(
        config: ControlPlaneConfig,
        ctx: ReconcilerContext,
        after_init: Option<AfterInit>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            config: RwLock::new(config.clone()),
            last_state: ArcSwapOption::empty(),
            snapshots: ArcSwapOption::empty(),
            initialized: AtomicBool::new(false),
        });

        let (notify, wake) = mpsc::channel(1);
        let mut worker = Worker {
            shared: shared.clone(),
            balancers: HashMap::new(),
            fwmarks: Arc::new(FwmarkAllocator::new(config.fwmark.base, config.fwmark.size)),
            notify,
            ctx,
            after_init,
            cancel: cancel.clone(),
        };
        for balancer in &config.balancers {
            worker.spawn_balancer(balancer.clone())?;
        }
        worker.publish_gauges(&config);

        let (commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(worker.run(commands_rx, wake, config.sync_interval()));
        info!(
            cluster = %config.cluster,
            balancers = config.balancers.len(),
            "Control plane started"
        );

        Ok(Self {
            shared,
            commands,
            cancel,
            handle: Some(handle),
        })
    }

    /// Replace the configuration. Validation failures leave every balancer
    /// untouched.
    pub async fn reload(&self, config: ControlPlaneConfig) -> Result<()> {
        config.validate()?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Reload { config, reply })
            .await
            .map_err(|_| LbError::Config("control plane is stopped".into()))?;
        rx.await
            .map_err(|_| LbError::Config("control plane stopped during reload".into()))?
    }

    /// Ask for an immediate rebuild and push
    pub fn trigger_sync(&self) {
        let _ = self.commands.try_send(Command::Sync);
    }

    pub fn config(&self) -> ControlPlaneConfig {
        self.shared.config.read().clone()
    }

    /// State of the last successful push
    pub fn last_state(&self) -> Option<Arc<DataPlaneState>> {
        self.shared.last_state.load_full()
    }

    /// Balancer snapshots the last push was built from
    pub fn snapshots(&self) -> Vec<Arc<BalancerSnapshot>> {
        self.shared
            .snapshots
            .load_full()
            .map(|s| s.as_ref().clone())
            .unwrap_or_default()
    }

    /// Every balancer has reported and the result reached the data plane
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ControlPlaneReconciler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    shared: Arc<Shared>,
    balancers: HashMap<BalancerId, Balancer>,
    fwmarks: Arc<FwmarkAllocator>,
    notify: mpsc::Sender<()>,
    ctx: ReconcilerContext,
    after_init: Option<AfterInit>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut wake: mpsc::Receiver<()>,
        sync_interval: std::time::Duration,
    ) {
        let mut ticker = interval(sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    Command::Reload { config, reply } => {
                        let interval_changed = config.sync_interval() != ticker.period();
                        let result = self.reload(config).await;
                        if interval_changed && result.is_ok() {
                            let period = self.shared.config.read().sync_interval();
                            ticker = interval(period);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                        let _ = reply.send(result);
                        self.sync().await;
                    }
                    Command::Sync => self.sync().await,
                },
                _ = ticker.tick() => self.sync().await,
                Some(()) = wake.recv() => self.sync().await,
            }
        }

        let stopping = self.balancers.len();
        for (_, balancer) in self.balancers.drain() {
            balancer.stop().await;
        }
        info!(balancers = stopping, "Control plane stopped");
    }

    fn spawn_balancer(&mut self, config: BalancerConfig) -> Result<()> {
        let ctx = BalancerContext {
            resolver: self.ctx.resolver.clone(),
            fwmarks: self.fwmarks.clone(),
            notify: self.notify.clone(),
        };
        let balancer = Balancer::spawn(config, ctx, self.cancel.child_token())?;
        self.balancers.insert(balancer.id().clone(), balancer);
        Ok(())
    }

    async fn reload(&mut self, config: ControlPlaneConfig) -> Result<()> {
        config.validate()?;
        let current = self.shared.config.read().clone();

        if config.fwmark != current.fwmark {
            warn!("fwmark pool changes take effect after restart");
        }

        let diff = compare(
            &current.balancers,
            &config.balancers,
            |b| b.id(),
            |a, b| a == b,
        );

        for old in &diff.deleted {
            if let Some(balancer) = self.balancers.remove(&old.id()) {
                balancer.stop().await;
                info!(balancer = %old.id(), "Balancer removed");
            }
        }

        for (old, new) in &diff.changed {
            if old.setup_name != new.setup_name {
                // Setup name is part of the identity
                if let Some(balancer) = self.balancers.remove(&old.id()) {
                    balancer.stop().await;
                }
                self.spawn_balancer((*new).clone())?;
                continue;
            }
            match self.balancers.get(&new.id()) {
                Some(balancer) => balancer.update((*new).clone()).await?,
                None => self.spawn_balancer((*new).clone())?,
            }
        }

        for new in &diff.added {
            self.spawn_balancer((*new).clone())?;
        }

        info!(
            added = diff.added.len(),
            deleted = diff.deleted.len(),
            changed = diff.changed.len(),
            "Configuration reloaded"
        );
        self.publish_gauges(&config);
        *self.shared.config.write() = config;
        Ok(())
    }

    fn publish_gauges(&self, config: &ControlPlaneConfig) {
        self.ctx
            .metrics
            .gauge("lb_control_balancers")
            .set(config.balancers.len() as u64);
        self.ctx
            .metrics
            .gauge("lb_control_fwmarks_available")
            .set(self.fwmarks.available() as u64);
    }

    /// Rebuild the whole state and push it. The first push waits for every
    /// balancer; later ones carry the last pushed entry of a balancer that
    /// has not reported since it was (re)started, or leave it out.
    async fn sync(&mut self) {
        let config = self.shared.config.read().clone();
        let initialized = self.shared.initialized.load(Ordering::Acquire);
        let previous = self.shared.snapshots.load_full();

        let mut snapshots = Vec::with_capacity(config.balancers.len());
        for balancer in &config.balancers {
            let id = balancer.id();
            if let Some(snapshot) = self.balancers.get(&id).and_then(|b| b.snapshot()) {
                snapshots.push(snapshot);
                continue;
            }
            if !initialized {
                debug!(balancer = %id, "Balancer has not reported yet, holding push");
                return;
            }

            let key = balancer.service_key();
            let carried = previous
                .as_ref()
                .and_then(|prev| prev.iter().find(|s| s.state.key == key).cloned());
            match carried {
                Some(snapshot) => {
                    debug!(balancer = %id, "Balancer has not reported yet, keeping its last pushed state");
                    snapshots.push(snapshot);
                }
                None => debug!(balancer = %id, "Balancer has not reported yet, left out of this push"),
            }
        }

        let state = build_state(&config, &snapshots);
        for balancer in &state.balancers {
            self.ctx.resolver.register_service(balancer.key, &balancer.name);
        }

        let start = Instant::now();
        match self.ctx.client.set(&state).await {
            Ok(()) => {
                self.ctx.metrics.counter("lb_control_pushes_total").inc();
                self.ctx
                    .metrics
                    .histogram("lb_control_push_ms")
                    .record(start.elapsed().as_secs_f64() * 1000.0);
                self.ctx
                    .metrics
                    .gauge("lb_control_routes_announced")
                    .set(state.dynamic_routes.len() as u64);
                debug!(
                    services = state.balancers.len(),
                    routes = state.dynamic_routes.len(),
                    "Data plane state pushed"
                );

                self.shared.last_state.store(Some(Arc::new(state)));
                self.shared.snapshots.store(Some(Arc::new(snapshots)));
                if !self.shared.initialized.swap(true, Ordering::AcqRel) {
                    info!(cluster = %config.cluster, "Control plane initialised");
                    if let Some(callback) = self.after_init.take() {
                        callback();
                    }
                }
            }
            Err(e) => {
                self.ctx.metrics.counter("lb_control_push_failures_total").inc();
                error!(error = %e, "Failed to push data plane state");
            }
        }
        self.ctx
            .metrics
            .gauge("lb_control_fwmarks_available")
            .set(self.fwmarks.available() as u64);
    }
}
