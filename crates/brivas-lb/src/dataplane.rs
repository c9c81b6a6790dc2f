//! Data Plane Manager
//!
//! Converges the kernel LB table, the BGP speaker and the interface
//! addresses onto a desired [`DataPlaneState`]. Every call diffs the
//! desired state against what the collaborators report live and applies
//! only the difference, in an order that never blackholes traffic:
//! routes go away before the services behind them, and come back only
//! after the services and addresses exist.

use async_trait::async_trait;
use brivas_core::{
    AddressFamily, BalancerState, DataPlaneState, DynamicRoute, LinkAddress, UpstreamState,
};
use brivas_telemetry::MetricsRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::comparator::{compare, SetDiff};
use crate::error::{LbError, Result};
use crate::modules::DataPlaneModules;
use crate::stats::{ServiceTraffic, StatsCollector};

/// What happens to the live state when the data plane stops
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn shutdown(&self, modules: &DataPlaneModules) -> Result<()>;
}

/// Withdraw every route, wait out the hold times, then remove every
/// service and address
#[derive(Debug, Default, Clone, Copy)]
pub struct WithdrawAndFlush;

#[async_trait]
impl ShutdownHandler for WithdrawAndFlush {
    async fn shutdown(&self, modules: &DataPlaneModules) -> Result<()> {
        let mut first_error: Option<LbError> = None;
        let mut keep = |result: Result<()>| {
            if let Err(e) = result {
                warn!(error = %e, "Shutdown step failed");
                first_error.get_or_insert(e);
            }
        };

        match modules.bgp.list_paths().await {
            Ok(routes) => {
                for route in &routes {
                    keep(modules.bgp.withdraw(route).await);
                }
                let hold = max_hold_time(routes.iter());
                if !hold.is_zero() {
                    info!(hold_ms = hold.as_millis() as u64, "Waiting for peers to drop routes");
                    tokio::time::sleep(hold).await;
                }
            }
            Err(e) => keep(Err(e)),
        }

        match modules.ipvs.list_services().await {
            Ok(services) => {
                for service in &services {
                    keep(modules.ipvs.delete_service(&service.key).await);
                }
            }
            Err(e) => keep(Err(e)),
        }

        match modules.addresses.list().await {
            Ok(links) => {
                for link in &links {
                    keep(modules.addresses.delete(link).await);
                }
            }
            Err(e) => keep(Err(e)),
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Leave the kernel and BGP untouched so a restarted data plane takes over
/// without dropping traffic
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepState;

#[async_trait]
impl ShutdownHandler for KeepState {
    async fn shutdown(&self, _modules: &DataPlaneModules) -> Result<()> {
        info!("Leaving data plane state in place");
        Ok(())
    }
}

fn max_hold_time<'a>(routes: impl Iterator<Item = &'a DynamicRoute>) -> Duration {
    routes.map(|r| r.hold_time()).max().unwrap_or_default()
}

fn same_balancer(live: &BalancerState, desired: &BalancerState) -> bool {
    live.scheduler == desired.scheduler
        && !compare(
            &live.upstreams,
            &desired.upstreams,
            |u| u.key(),
            |a, b| a.kernel_equal(b),
        )
        .has_changes()
}

fn validate(desired: &DataPlaneState) -> Result<()> {
    desired.validate()?;
    for balancer in &desired.balancers {
        let family = balancer.key.family();
        if let Some(upstream) = balancer
            .upstreams
            .iter()
            .find(|u| AddressFamily::of(&u.address) != family)
        {
            return Err(LbError::Validation(format!(
                "upstream {} of {} is not {}",
                upstream.address, balancer.key, family
            )));
        }
    }
    Ok(())
}

struct Inner {
    shut_down: bool,
    bgp_asn: Option<u32>,
}

pub struct DataPlaneManager {
    modules: DataPlaneModules,
    shutdown_handler: Arc<dyn ShutdownHandler>,
    inner: Mutex<Inner>,
    healthy: AtomicBool,
    stats: StatsCollector,
    metrics: MetricsRegistry,
}

impl DataPlaneManager {
    pub fn new(
        modules: DataPlaneModules,
        shutdown_handler: Arc<dyn ShutdownHandler>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            modules,
            shutdown_handler,
            inner: Mutex::new(Inner {
                shut_down: false,
                bgp_asn: None,
            }),
            healthy: AtomicBool::new(true),
            stats: StatsCollector::new(metrics.clone()),
            metrics,
        }
    }

    /// False after a failed apply, until the next successful one
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Accumulated per-service traffic
    pub fn stats(&self) -> Vec<ServiceTraffic> {
        self.stats.snapshot()
    }

    pub fn modules(&self) -> &DataPlaneModules {
        &self.modules
    }

    /// Converge the live state onto `desired`
    pub async fn set_state(&self, desired: &DataPlaneState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return Err(LbError::ShutDown);
        }
        validate(desired)?;

        for balancer in &desired.balancers {
            self.modules.resolver.register_service(balancer.key, &balancer.name);
        }

        let start = Instant::now();
        let result = self.apply(&mut inner, desired).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let result = match result {
            Ok(0) => {
                debug!("Data plane already in desired state");
                self.healthy.store(true, Ordering::Release);
                Ok(())
            }
            Ok(mutations) => {
                self.healthy.store(true, Ordering::Release);
                self.metrics.counter("lb_dataplane_applies_total").inc();
                self.metrics
                    .counter("lb_dataplane_mutations_total")
                    .add(mutations as u64);
                self.metrics.histogram("lb_dataplane_apply_ms").record(elapsed_ms);
                info!(mutations, elapsed_ms, "Data plane state applied");
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                self.metrics.counter("lb_dataplane_apply_failures_total").inc();
                error!(error = %e, "Failed to apply data plane state");
                Err(e)
            }
        };

        self.collect_stats().await;
        result
    }

    async fn collect_stats(&self) {
        match self.modules.ipvs.stats().await {
            Ok(samples) => self.stats.record(&samples),
            Err(e) => warn!(error = %e, "Failed to collect traffic counters"),
        }
    }

    /// Live state without display names
    async fn live_state(&self) -> Result<DataPlaneState> {
        let services = self.modules.ipvs.list_services().await?;
        let mut balancers = Vec::with_capacity(services.len());
        for service in services {
            let upstreams = self.modules.ipvs.get_real_servers(&service.key).await?;
            balancers.push(BalancerState {
                name: String::new(),
                key: service.key,
                scheduler: service.scheduler,
                upstreams,
            });
        }

        Ok(DataPlaneState {
            balancers,
            dynamic_routes: self.modules.bgp.list_paths().await?,
            link_addresses: self.modules.addresses.list().await?,
        })
    }

    /// Live state with service and host names filled in
    pub async fn get_state(&self) -> Result<DataPlaneState> {
        let _inner = self.inner.lock().await;
        let mut state = self.live_state().await?;
        let resolver = &self.modules.resolver;
        for balancer in &mut state.balancers {
            balancer.name = resolver.service_lookup(&balancer.key).unwrap_or_default();
            for upstream in &mut balancer.upstreams {
                upstream.hostname = resolver
                    .reverse_lookup(upstream.address)
                    .await
                    .unwrap_or_default();
            }
        }
        Ok(state)
    }

    /// Run the shutdown handler once; `set_state` is refused afterwards
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            debug!("Data plane already shut down");
            return Ok(());
        }
        inner.shut_down = true;
        info!("Shutting down data plane");
        self.shutdown_handler.shutdown(&self.modules).await
    }

    pub async fn is_shut_down(&self) -> bool {
        self.inner.lock().await.shut_down
    }

    /// Returns the number of mutations made
    async fn apply(&self, inner: &mut Inner, desired: &DataPlaneState) -> Result<usize> {
        let live = self.live_state().await?;

        let services = compare(
            &live.balancers,
            &desired.balancers,
            |b| b.key,
            same_balancer,
        );
        let routes = compare(
            &live.dynamic_routes,
            &desired.dynamic_routes,
            |r| r.prefix,
            |a, b| a == b,
        );
        let links = compare(
            &live.link_addresses,
            &desired.link_addresses,
            |l| l.address,
            |a, b| a == b,
        );

        if !services.has_changes() && !routes.has_changes() && !links.has_changes() {
            return Ok(0);
        }

        debug!(
            services_added = services.added.len(),
            services_deleted = services.deleted.len(),
            services_changed = services.changed.len(),
            routes_added = routes.added.len(),
            routes_deleted = routes.deleted.len(),
            links_added = links.added.len(),
            links_deleted = links.deleted.len(),
            "Applying data plane diff"
        );

        let mut mutations = 0;
        mutations += self.withdraw_routes(&routes).await?;
        mutations += self.add_services(&services).await?;
        mutations += self.add_links(&links).await?;
        mutations += self.update_services(&services).await?;
        mutations += self.advertise_routes(inner, &routes).await?;
        mutations += self.delete_services(&services).await?;
        mutations += self.delete_links(&links).await?;
        Ok(mutations)
    }

    async fn withdraw_routes(&self, routes: &SetDiff<'_, DynamicRoute>) -> Result<usize> {
        for route in &routes.deleted {
            info!(prefix = %route.prefix, "Withdrawing route");
            self.modules.bgp.withdraw(route).await?;
        }

        let hold = max_hold_time(routes.deleted.iter().copied());
        if !hold.is_zero() {
            debug!(hold_ms = hold.as_millis() as u64, "Waiting for peers to drop withdrawn routes");
            tokio::time::sleep(hold).await;
        }
        Ok(routes.deleted.len())
    }

    async fn add_services(&self, services: &SetDiff<'_, BalancerState>) -> Result<usize> {
        let mut mutations = 0;
        for balancer in &services.added {
            info!(service = %balancer.key, name = %balancer.name, "Adding service");
            self.modules
                .ipvs
                .add_service(&balancer.key, &balancer.scheduler)
                .await?;
            mutations += 1;
            if !balancer.upstreams.is_empty() {
                self.modules
                    .ipvs
                    .add_real_servers(&balancer.key, &balancer.upstreams)
                    .await?;
                mutations += 1;
            }
        }
        Ok(mutations)
    }

    async fn add_links(&self, links: &SetDiff<'_, LinkAddress>) -> Result<usize> {
        let mut mutations = 0;
        let added = links.added.iter().copied();
        let moved = links.changed.iter().map(|(_, new)| *new);
        for link in added.chain(moved) {
            info!(address = %link.address, interface = %link.interface, "Adding link address");
            self.modules.addresses.add(link).await?;
            mutations += 1;
        }
        Ok(mutations)
    }

    async fn update_services(&self, services: &SetDiff<'_, BalancerState>) -> Result<usize> {
        let mut mutations = 0;
        for (live, desired) in &services.changed {
            let key = &desired.key;
            if live.scheduler != desired.scheduler {
                info!(service = %key, scheduler = %desired.scheduler, "Updating scheduler");
                self.modules.ipvs.update_service(key, &desired.scheduler).await?;
                mutations += 1;
            }

            let reals = compare(
                &live.upstreams,
                &desired.upstreams,
                |u| u.key(),
                |a, b| a.kernel_equal(b),
            );
            let added: Vec<UpstreamState> = reals.added.iter().map(|u| (*u).clone()).collect();
            let updated: Vec<UpstreamState> =
                reals.changed.iter().map(|(_, new)| (*new).clone()).collect();
            let deleted: Vec<UpstreamState> = reals.deleted.iter().map(|u| (*u).clone()).collect();

            if !added.is_empty() {
                self.modules.ipvs.add_real_servers(key, &added).await?;
                mutations += 1;
            }
            if !updated.is_empty() {
                self.modules.ipvs.update_real_servers(key, &updated).await?;
                mutations += 1;
            }
            if !deleted.is_empty() {
                self.modules.ipvs.delete_real_servers(key, &deleted).await?;
                mutations += 1;
            }
            debug!(
                service = %key,
                added = added.len(),
                updated = updated.len(),
                deleted = deleted.len(),
                "Real servers reconciled"
            );
        }
        Ok(mutations)
    }

    async fn advertise_routes(&self, inner: &mut Inner, routes: &SetDiff<'_, DynamicRoute>) -> Result<usize> {
        let mut mutations = 0;
        let added = routes.added.iter().copied();
        let changed = routes.changed.iter().map(|(_, new)| *new);
        for route in added.chain(changed) {
            match inner.bgp_asn {
                None => {
                    self.modules.bgp.init(route.local_asn).await?;
                    inner.bgp_asn = Some(route.local_asn);
                    mutations += 1;
                }
                Some(asn) if asn != route.local_asn => {
                    warn!(
                        prefix = %route.prefix,
                        local_asn = route.local_asn,
                        speaker_asn = asn,
                        "Route ASN differs from the running speaker"
                    );
                }
                Some(_) => {}
            }
            info!(prefix = %route.prefix, community = %route.community, "Advertising route");
            self.modules.bgp.advertise(route).await?;
            mutations += 1;
        }
        Ok(mutations)
    }

    async fn delete_services(&self, services: &SetDiff<'_, BalancerState>) -> Result<usize> {
        for balancer in &services.deleted {
            info!(service = %balancer.key, "Deleting service");
            self.modules.ipvs.delete_service(&balancer.key).await?;
        }
        Ok(services.deleted.len())
    }

    async fn delete_links(&self, links: &SetDiff<'_, LinkAddress>) -> Result<usize> {
        let mut mutations = 0;
        let deleted = links.deleted.iter().copied();
        let moved = links.changed.iter().map(|(old, _)| *old);
        for link in deleted.chain(moved) {
            info!(address = %link.address, interface = %link.interface, "Deleting link address");
            self.modules.addresses.delete(link).await?;
            mutations += 1;
        }
        Ok(mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::memory::{MemoryDataPlane, Op};
    use crate::modules::{AddressTableModule, BgpModule, IpvsModule};
    use crate::stats::TrafficCounters;
    use brivas_core::{ForwardMethod, Protocol, ServiceKey};
    use std::net::SocketAddr;

    fn key(vip: &str, port: u16) -> ServiceKey {
        ServiceKey::Tuple {
            vip: vip.parse().unwrap(),
            port,
            protocol: Protocol::Tcp,
        }
    }

    fn real(addr: &str, weight: u32) -> UpstreamState {
        UpstreamState {
            hostname: String::new(),
            address: addr.parse().unwrap(),
            port: 443,
            weight,
            forward_method: ForwardMethod::Tunnel,
        }
    }

    fn route(prefix: &str) -> DynamicRoute {
        DynamicRoute {
            local_asn: 65000,
            peer_asn: 65001,
            community: "65000:100".into(),
            prefix: prefix.parse().unwrap(),
            hold_time_ms: 0,
        }
    }

    fn link(address: &str) -> LinkAddress {
        LinkAddress {
            interface: "lo".into(),
            address: address.parse().unwrap(),
        }
    }

    fn manager(plane: &MemoryDataPlane) -> DataPlaneManager {
        DataPlaneManager::new(plane.modules(), Arc::new(WithdrawAndFlush), MetricsRegistry::new())
    }

    #[tokio::test]
    async fn test_apply_order() {
        let plane = MemoryDataPlane::default();
        let kept = key("10.0.0.1", 443);
        let stale = key("10.0.0.2", 443);
        let fresh = key("10.0.0.3", 443);

        plane.ipvs.add_service(&kept, "wrr").await.unwrap();
        plane
            .ipvs
            .add_real_servers(&kept, &[real("10.1.0.1", 1000), real("10.1.0.2", 1000)])
            .await
            .unwrap();
        plane.ipvs.add_service(&stale, "wrr").await.unwrap();
        plane.bgp.init(65000).await.unwrap();
        plane.bgp.advertise(&route("10.0.0.2/32")).await.unwrap();
        plane.addresses.add(&link("10.0.0.2")).await.unwrap();
        plane.journal.clear();

        let mut kept_state = BalancerState::new(
            "kept",
            kept,
            vec![real("10.1.0.1", 0), real("10.1.0.3", 1000)],
        );
        kept_state.scheduler = "rr".into();
        let desired = DataPlaneState {
            balancers: vec![
                kept_state,
                BalancerState::new("fresh", fresh, vec![real("10.1.0.4", 1000)]),
            ],
            dynamic_routes: vec![route("10.0.0.3/32")],
            link_addresses: vec![link("10.0.0.3")],
        };

        let manager = manager(&plane);
        manager.set_state(&desired).await.unwrap();

        let sock = |s: &str| -> SocketAddr { s.parse().unwrap() };
        assert_eq!(
            plane.journal.entries(),
            vec![
                Op::Withdraw("10.0.0.2/32".parse().unwrap()),
                Op::AddService(fresh),
                Op::AddReals(fresh, vec![sock("10.1.0.4:443")]),
                Op::AddAddress(link("10.0.0.3")),
                Op::UpdateService(kept),
                Op::AddReals(kept, vec![sock("10.1.0.3:443")]),
                Op::UpdateReals(kept, vec![sock("10.1.0.1:443")]),
                Op::DeleteReals(kept, vec![sock("10.1.0.2:443")]),
                Op::BgpInit(65000),
                Op::Advertise("10.0.0.3/32".parse().unwrap()),
                Op::DeleteService(stale),
                Op::DeleteAddress(link("10.0.0.2")),
            ]
        );
        assert!(manager.is_healthy());
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let plane = MemoryDataPlane::default();
        let manager = manager(&plane);
        let desired = DataPlaneState {
            balancers: vec![BalancerState::new(
                "svc",
                key("10.0.0.1", 443),
                vec![real("10.1.0.1", 1000)],
            )],
            dynamic_routes: vec![route("10.0.0.1/32")],
            link_addresses: vec![link("10.0.0.1")],
        };

        manager.set_state(&desired).await.unwrap();
        let applied = plane.journal.len();
        manager.set_state(&desired).await.unwrap();
        assert_eq!(plane.journal.len(), applied);
    }

    #[tokio::test]
    async fn test_moved_address_added_before_removed() {
        let plane = MemoryDataPlane::default();
        plane.addresses.add(&link("10.0.0.1")).await.unwrap();
        plane.journal.clear();

        let moved = LinkAddress {
            interface: "dummy0".into(),
            address: "10.0.0.1".parse().unwrap(),
        };
        let desired = DataPlaneState {
            link_addresses: vec![moved.clone()],
            ..Default::default()
        };
        manager(&plane).set_state(&desired).await.unwrap();
        assert_eq!(
            plane.journal.entries(),
            vec![Op::AddAddress(moved), Op::DeleteAddress(link("10.0.0.1"))]
        );
    }

    #[tokio::test]
    async fn test_failure_marks_unhealthy_until_next_success() {
        let plane = MemoryDataPlane::default();
        let manager = manager(&plane);
        let desired = DataPlaneState {
            balancers: vec![BalancerState::new("svc", key("10.0.0.1", 443), vec![])],
            ..Default::default()
        };

        plane.ipvs.fail_mutations(true);
        assert!(manager.set_state(&desired).await.is_err());
        assert!(!manager.is_healthy());

        plane.ipvs.fail_mutations(false);
        manager.set_state(&desired).await.unwrap();
        assert!(manager.is_healthy());
    }

    #[tokio::test]
    async fn test_invalid_state_rejected_before_any_change() {
        let plane = MemoryDataPlane::default();
        let manager = manager(&plane);
        let desired = DataPlaneState {
            balancers: vec![BalancerState::new(
                "svc",
                key("10.0.0.1", 443),
                vec![real("2001:db8::1", 1000)],
            )],
            ..Default::default()
        };
        let err = manager.set_state(&desired).await.unwrap_err();
        assert!(matches!(err, LbError::Validation(_)));
        assert!(plane.journal.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_once() {
        let plane = MemoryDataPlane::default();
        let manager = manager(&plane);
        let desired = DataPlaneState {
            balancers: vec![BalancerState::new(
                "svc",
                key("10.0.0.1", 443),
                vec![real("10.1.0.1", 1000)],
            )],
            dynamic_routes: vec![route("10.0.0.1/32")],
            link_addresses: vec![link("10.0.0.1")],
        };
        manager.set_state(&desired).await.unwrap();
        plane.journal.clear();

        manager.shutdown().await.unwrap();
        assert_eq!(
            plane.journal.entries(),
            vec![
                Op::Withdraw("10.0.0.1/32".parse().unwrap()),
                Op::DeleteService(key("10.0.0.1", 443)),
                Op::DeleteAddress(link("10.0.0.1")),
            ]
        );

        manager.shutdown().await.unwrap();
        assert_eq!(plane.journal.len(), 3);
        assert!(matches!(manager.set_state(&desired).await, Err(LbError::ShutDown)));
        assert!(manager.is_shut_down().await);
    }

    #[tokio::test]
    async fn test_keep_state_shutdown() {
        let plane = MemoryDataPlane::default();
        let manager = DataPlaneManager::new(plane.modules(), Arc::new(KeepState), MetricsRegistry::new());
        let desired = DataPlaneState {
            balancers: vec![BalancerState::new("svc", key("10.0.0.1", 443), vec![])],
            ..Default::default()
        };
        manager.set_state(&desired).await.unwrap();
        manager.shutdown().await.unwrap();
        assert_eq!(plane.ipvs.list_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_pass_runs_on_noop() {
        let plane = MemoryDataPlane::default();
        let manager = manager(&plane);
        let svc = key("10.0.0.1", 443);
        let desired = DataPlaneState {
            balancers: vec![BalancerState::new("svc", svc, vec![real("10.1.0.1", 1000)])],
            ..Default::default()
        };
        manager.set_state(&desired).await.unwrap();

        let sample = |bytes_in| TrafficCounters {
            bytes_in,
            ..Default::default()
        };
        plane.ipvs.set_counters(&svc, None, sample(500));
        manager.set_state(&desired).await.unwrap();
        plane.ipvs.set_counters(&svc, None, sample(800));
        manager.set_state(&desired).await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].totals.bytes_in, 800);
    }
}
