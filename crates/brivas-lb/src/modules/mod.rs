//! External collaborators of the data plane
//!
//! The manager only talks to the kernel LB table, the BGP speaker, the
//! interface address table and the naming cache through these traits.
//! `memory` backs tests and dry runs; the other adapters shell out to the
//! usual Linux tooling.

use async_trait::async_trait;
use brivas_core::{AddressFamily, DynamicRoute, LinkAddress, ServiceKey, UpstreamState};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::Result;
use crate::stats::TrafficCounters;

pub mod command;
pub mod gobgp;
pub mod iproute;
pub mod ipvsadm;
pub mod memory;
pub mod resolver;

pub use gobgp::GoBgp;
pub use iproute::IpRoute2;
pub use ipvsadm::IpvsAdm;
pub use memory::{Journal, MemoryDataPlane, Op};
pub use resolver::CachingResolver;

/// A kernel LB service as listed by the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpvsService {
    pub key: ServiceKey,
    pub scheduler: String,
}

/// Raw counters of one service and its reals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub key: ServiceKey,
    pub counters: TrafficCounters,
    pub reals: Vec<(SocketAddr, TrafficCounters)>,
}

#[async_trait]
pub trait IpvsModule: Send + Sync {
    async fn add_service(&self, key: &ServiceKey, scheduler: &str) -> Result<()>;

    async fn update_service(&self, key: &ServiceKey, scheduler: &str) -> Result<()>;

    async fn delete_service(&self, key: &ServiceKey) -> Result<()>;

    async fn list_services(&self) -> Result<Vec<IpvsService>>;

    async fn get_real_servers(&self, key: &ServiceKey) -> Result<Vec<UpstreamState>>;

    async fn add_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()>;

    async fn update_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()>;

    async fn delete_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()>;

    /// Cumulative traffic counters of every service
    async fn stats(&self) -> Result<Vec<ServiceStats>>;
}

#[async_trait]
pub trait BgpModule: Send + Sync {
    async fn init(&self, local_asn: u32) -> Result<()>;

    async fn advertise(&self, route: &DynamicRoute) -> Result<()>;

    async fn withdraw(&self, route: &DynamicRoute) -> Result<()>;

    async fn list_paths(&self) -> Result<Vec<DynamicRoute>>;

    async fn is_session_established(&self) -> Result<bool>;
}

#[async_trait]
pub trait AddressTableModule: Send + Sync {
    async fn add(&self, link: &LinkAddress) -> Result<()>;

    async fn delete(&self, link: &LinkAddress) -> Result<()>;

    async fn is_exists(&self, link: &LinkAddress) -> Result<bool>;

    async fn list(&self) -> Result<Vec<LinkAddress>>;
}

/// Naming cache shared by the balancers and the data plane
#[async_trait]
pub trait ResolverModule: Send + Sync {
    /// Address of `host` in `family`; IP literals are returned as-is
    async fn lookup(&self, host: &str, family: AddressFamily) -> Result<IpAddr>;

    /// Best known name for an address
    async fn reverse_lookup(&self, address: IpAddr) -> Option<String>;

    /// Name a service key was registered under
    fn service_lookup(&self, key: &ServiceKey) -> Option<String>;

    fn register_service(&self, key: ServiceKey, name: &str);

    /// Cluster this resolver serves
    fn cluster(&self) -> &str;
}

/// Everything the data plane manager drives
#[derive(Clone)]
pub struct DataPlaneModules {
    pub ipvs: Arc<dyn IpvsModule>,
    pub bgp: Arc<dyn BgpModule>,
    pub addresses: Arc<dyn AddressTableModule>,
    pub resolver: Arc<dyn ResolverModule>,
}
