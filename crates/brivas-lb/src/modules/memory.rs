//! In-memory collaborators
//!
//! Behave like the kernel and BGP speaker would, and record every mutation
//! in a shared [`Journal`] so callers can assert what was touched and in
//! which order. Used by the tests and by dry-run deployments.

use async_trait::async_trait;
use brivas_core::{AddressFamily, DynamicRoute, LinkAddress, ServiceKey, UpstreamState};
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    AddressTableModule, BgpModule, DataPlaneModules, IpvsModule, IpvsService, ResolverModule,
    ServiceStats,
};
use crate::error::{LbError, Result};
use crate::stats::TrafficCounters;

/// One recorded mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    BgpInit(u32),
    Advertise(IpNet),
    Withdraw(IpNet),
    AddService(ServiceKey),
    UpdateService(ServiceKey),
    DeleteService(ServiceKey),
    AddReals(ServiceKey, Vec<SocketAddr>),
    UpdateReals(ServiceKey, Vec<SocketAddr>),
    DeleteReals(ServiceKey, Vec<SocketAddr>),
    AddAddress(LinkAddress),
    DeleteAddress(LinkAddress),
}

/// Ordered log of mutations shared by the in-memory modules
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Op>>>);

impl Journal {
    pub fn record(&self, op: Op) {
        self.0.lock().push(op);
    }

    pub fn entries(&self) -> Vec<Op> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

fn real_keys(reals: &[UpstreamState]) -> Vec<SocketAddr> {
    reals.iter().map(|r| r.key()).collect()
}

#[derive(Debug, Default)]
struct MemoryService {
    scheduler: String,
    reals: Vec<UpstreamState>,
    counters: TrafficCounters,
    real_counters: HashMap<SocketAddr, TrafficCounters>,
}

/// Kernel LB table
#[derive(Debug, Default)]
pub struct MemoryIpvs {
    journal: Journal,
    services: Mutex<BTreeMap<ServiceKey, MemoryService>>,
    failing: AtomicBool,
}

impl MemoryIpvs {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    /// Make every following mutation fail until reset
    pub fn fail_mutations(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Overwrite the cumulative counters of a service and optionally one real
    pub fn set_counters(&self, key: &ServiceKey, real: Option<SocketAddr>, counters: TrafficCounters) {
        if let Some(service) = self.services.lock().get_mut(key) {
            match real {
                Some(addr) => {
                    service.real_counters.insert(addr, counters);
                }
                None => service.counters = counters,
            }
        }
    }

    fn check_failing(&self, action: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LbError::Ipvs(format!("injected failure on {}", action)));
        }
        Ok(())
    }
}

#[async_trait]
impl IpvsModule for MemoryIpvs {
    async fn add_service(&self, key: &ServiceKey, scheduler: &str) -> Result<()> {
        self.check_failing("add_service")?;
        let mut services = self.services.lock();
        if services.contains_key(key) {
            return Err(LbError::Ipvs(format!("service {} already exists", key)));
        }
        services.insert(
            *key,
            MemoryService {
                scheduler: scheduler.to_string(),
                ..Default::default()
            },
        );
        self.journal.record(Op::AddService(*key));
        Ok(())
    }

    async fn update_service(&self, key: &ServiceKey, scheduler: &str) -> Result<()> {
        self.check_failing("update_service")?;
        let mut services = self.services.lock();
        let service = services
            .get_mut(key)
            .ok_or_else(|| LbError::Ipvs(format!("no service {}", key)))?;
        service.scheduler = scheduler.to_string();
        self.journal.record(Op::UpdateService(*key));
        Ok(())
    }

    async fn delete_service(&self, key: &ServiceKey) -> Result<()> {
        self.check_failing("delete_service")?;
        self.services
            .lock()
            .remove(key)
            .ok_or_else(|| LbError::Ipvs(format!("no service {}", key)))?;
        self.journal.record(Op::DeleteService(*key));
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<IpvsService>> {
        Ok(self
            .services
            .lock()
            .iter()
            .map(|(key, service)| IpvsService {
                key: *key,
                scheduler: service.scheduler.clone(),
            })
            .collect())
    }

    async fn get_real_servers(&self, key: &ServiceKey) -> Result<Vec<UpstreamState>> {
        self.services
            .lock()
            .get(key)
            .map(|s| s.reals.clone())
            .ok_or_else(|| LbError::Ipvs(format!("no service {}", key)))
    }

    async fn add_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()> {
        self.check_failing("add_real_servers")?;
        let mut services = self.services.lock();
        let service = services
            .get_mut(key)
            .ok_or_else(|| LbError::Ipvs(format!("no service {}", key)))?;
        for real in reals {
            if service.reals.iter().any(|r| r.key() == real.key()) {
                return Err(LbError::Ipvs(format!("real {} already in {}", real.key(), key)));
            }
            service.reals.push(UpstreamState {
                hostname: String::new(),
                ..real.clone()
            });
        }
        self.journal.record(Op::AddReals(*key, real_keys(reals)));
        Ok(())
    }

    async fn update_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()> {
        self.check_failing("update_real_servers")?;
        let mut services = self.services.lock();
        let service = services
            .get_mut(key)
            .ok_or_else(|| LbError::Ipvs(format!("no service {}", key)))?;
        for real in reals {
            let existing = service
                .reals
                .iter_mut()
                .find(|r| r.key() == real.key())
                .ok_or_else(|| LbError::Ipvs(format!("no real {} in {}", real.key(), key)))?;
            existing.weight = real.weight;
            existing.forward_method = real.forward_method;
        }
        self.journal.record(Op::UpdateReals(*key, real_keys(reals)));
        Ok(())
    }

    async fn delete_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()> {
        self.check_failing("delete_real_servers")?;
        let mut services = self.services.lock();
        let service = services
            .get_mut(key)
            .ok_or_else(|| LbError::Ipvs(format!("no service {}", key)))?;
        for real in reals {
            service.reals.retain(|r| r.key() != real.key());
            service.real_counters.remove(&real.key());
        }
        self.journal.record(Op::DeleteReals(*key, real_keys(reals)));
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<ServiceStats>> {
        Ok(self
            .services
            .lock()
            .iter()
            .map(|(key, service)| ServiceStats {
                key: *key,
                counters: service.counters,
                reals: service
                    .reals
                    .iter()
                    .map(|r| {
                        let counters = service.real_counters.get(&r.key()).copied().unwrap_or_default();
                        (r.key(), counters)
                    })
                    .collect(),
            })
            .collect())
    }
}

/// BGP speaker holding the advertised RIB
#[derive(Debug, Default)]
pub struct MemoryBgp {
    journal: Journal,
    local_asn: Mutex<Option<u32>>,
    rib: Mutex<BTreeMap<IpNet, DynamicRoute>>,
    established: AtomicBool,
}

impl MemoryBgp {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            established: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn local_asn(&self) -> Option<u32> {
        *self.local_asn.lock()
    }

    pub fn set_established(&self, established: bool) {
        self.established.store(established, Ordering::SeqCst);
    }
}

#[async_trait]
impl BgpModule for MemoryBgp {
    async fn init(&self, local_asn: u32) -> Result<()> {
        *self.local_asn.lock() = Some(local_asn);
        self.journal.record(Op::BgpInit(local_asn));
        Ok(())
    }

    async fn advertise(&self, route: &DynamicRoute) -> Result<()> {
        if self.local_asn.lock().is_none() {
            return Err(LbError::Bgp("speaker not initialised".into()));
        }
        self.rib.lock().insert(route.prefix, route.clone());
        self.journal.record(Op::Advertise(route.prefix));
        Ok(())
    }

    async fn withdraw(&self, route: &DynamicRoute) -> Result<()> {
        self.rib
            .lock()
            .remove(&route.prefix)
            .ok_or_else(|| LbError::Bgp(format!("{} is not advertised", route.prefix)))?;
        self.journal.record(Op::Withdraw(route.prefix));
        Ok(())
    }

    async fn list_paths(&self) -> Result<Vec<DynamicRoute>> {
        Ok(self.rib.lock().values().cloned().collect())
    }

    async fn is_session_established(&self) -> Result<bool> {
        Ok(self.established.load(Ordering::SeqCst))
    }
}

/// Interface address table
#[derive(Debug, Default)]
pub struct MemoryAddressTable {
    journal: Journal,
    addresses: Mutex<Vec<LinkAddress>>,
}

impl MemoryAddressTable {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }
}

#[async_trait]
impl AddressTableModule for MemoryAddressTable {
    async fn add(&self, link: &LinkAddress) -> Result<()> {
        let mut addresses = self.addresses.lock();
        if addresses.contains(link) {
            return Err(LbError::Address(format!(
                "{} already on {}",
                link.address, link.interface
            )));
        }
        addresses.push(link.clone());
        self.journal.record(Op::AddAddress(link.clone()));
        Ok(())
    }

    async fn delete(&self, link: &LinkAddress) -> Result<()> {
        let mut addresses = self.addresses.lock();
        let before = addresses.len();
        addresses.retain(|l| l != link);
        if addresses.len() == before {
            return Err(LbError::Address(format!(
                "{} not on {}",
                link.address, link.interface
            )));
        }
        self.journal.record(Op::DeleteAddress(link.clone()));
        Ok(())
    }

    async fn is_exists(&self, link: &LinkAddress) -> Result<bool> {
        Ok(self.addresses.lock().contains(link))
    }

    async fn list(&self) -> Result<Vec<LinkAddress>> {
        Ok(self.addresses.lock().clone())
    }
}

/// Resolver backed by a fixed host table
#[derive(Debug, Default)]
pub struct StaticResolver {
    cluster: String,
    hosts: DashMap<String, IpAddr>,
    services: DashMap<ServiceKey, String>,
}

impl StaticResolver {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            ..Default::default()
        }
    }

    pub fn insert(&self, host: &str, address: IpAddr) {
        self.hosts.insert(host.to_string(), address);
    }

    /// Make `host` unresolvable
    pub fn remove(&self, host: &str) {
        self.hosts.remove(host);
    }
}

#[async_trait]
impl ResolverModule for StaticResolver {
    async fn lookup(&self, host: &str, family: AddressFamily) -> Result<IpAddr> {
        let address = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => *self.hosts.get(host).ok_or_else(|| LbError::Resolve {
                host: host.to_string(),
                reason: "unknown host".into(),
            })?,
        };
        if !family.matches(&address) {
            return Err(LbError::Resolve {
                host: host.to_string(),
                reason: format!("no {} address", family),
            });
        }
        Ok(address)
    }

    async fn reverse_lookup(&self, address: IpAddr) -> Option<String> {
        self.hosts
            .iter()
            .find(|e| *e.value() == address)
            .map(|e| e.key().clone())
    }

    fn service_lookup(&self, key: &ServiceKey) -> Option<String> {
        self.services.get(key).map(|n| n.value().clone())
    }

    fn register_service(&self, key: ServiceKey, name: &str) {
        self.services.insert(key, name.to_string());
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }
}

/// A full set of in-memory modules sharing one journal
#[derive(Clone)]
pub struct MemoryDataPlane {
    pub journal: Journal,
    pub ipvs: Arc<MemoryIpvs>,
    pub bgp: Arc<MemoryBgp>,
    pub addresses: Arc<MemoryAddressTable>,
    pub resolver: Arc<StaticResolver>,
}

impl Default for MemoryDataPlane {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MemoryDataPlane {
    pub fn new(cluster: &str) -> Self {
        let journal = Journal::default();
        Self {
            ipvs: Arc::new(MemoryIpvs::new(journal.clone())),
            bgp: Arc::new(MemoryBgp::new(journal.clone())),
            addresses: Arc::new(MemoryAddressTable::new(journal.clone())),
            resolver: Arc::new(StaticResolver::new(cluster)),
            journal,
        }
    }

    pub fn modules(&self) -> DataPlaneModules {
        DataPlaneModules {
            ipvs: self.ipvs.clone(),
            bgp: self.bgp.clone(),
            addresses: self.addresses.clone(),
            resolver: self.resolver.clone(),
        }
    }
}
