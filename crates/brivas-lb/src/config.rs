//! Control plane configuration
//!
//! Already-typed input; the binary reads it from JSON. Everything optional
//! carries a serde default. `ControlPlaneConfig::validate` runs before any
//! balancer is created or touched.

use brivas_core::{AddressFamily, DynamicRoute, ForwardMethod, Protocol, ServiceKey};
use brivas_lb_health::{build_checker, build_discovery, DiscoveryConfig, HealthSettings};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{LbError, Result};
use crate::fwmark::{DEFAULT_FWMARK_BASE, DEFAULT_FWMARK_SIZE};

fn default_cluster() -> String {
    "default".to_string()
}

fn default_sync_interval_ms() -> u64 {
    10_000
}

fn default_link_interface() -> String {
    "lo".to_string()
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

fn default_scheduler() -> String {
    brivas_core::DEFAULT_SCHEDULER.to_string()
}

fn default_weight_up() -> u32 {
    1000
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_fwmark_base() -> u32 {
    DEFAULT_FWMARK_BASE
}

fn default_fwmark_size() -> u32 {
    DEFAULT_FWMARK_SIZE
}

/// Identity of a balancer; changing any part means a different balancer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BalancerId {
    pub name: String,
    pub vip: SocketAddr,
    pub protocol: Protocol,
}

impl fmt::Display for BalancerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}://{}", self.name, self.protocol, self.vip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwmarkPoolConfig {
    #[serde(default = "default_fwmark_base")]
    pub base: u32,
    #[serde(default = "default_fwmark_size")]
    pub size: u32,
}

impl Default for FwmarkPoolConfig {
    fn default() -> Self {
        Self {
            base: default_fwmark_base(),
            size: default_fwmark_size(),
        }
    }
}

/// BGP announcement of a balancer's VIP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub local_asn: u32,
    pub peer_asn: u32,
    #[serde(default)]
    pub community: String,
    /// Host prefix of the VIP when omitted
    #[serde(default)]
    pub prefix: Option<IpNet>,
    #[serde(default)]
    pub hold_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub name: String,
    #[serde(default)]
    pub setup_name: String,
    pub vip: IpAddr,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    /// Family real servers resolve to; the VIP's family when unset
    #[serde(default)]
    pub address_family: Option<AddressFamily>,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default)]
    pub forward_method: ForwardMethod,
    #[serde(default = "default_weight_up")]
    pub weight_up: u32,
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub health_check: HealthSettings,
    #[serde(default)]
    pub bgp: Option<RouteConfig>,
    /// Minimum healthy fraction before the route is announced
    #[serde(default)]
    pub announce_limit_ratio: f64,
    /// Mirror every real server under its own fwmark service
    #[serde(default)]
    pub fwmark: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl BalancerConfig {
    pub fn id(&self) -> BalancerId {
        BalancerId {
            name: self.name.clone(),
            vip: SocketAddr::new(self.vip, self.port),
            protocol: self.protocol,
        }
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::Tuple {
            vip: self.vip,
            port: self.port,
            protocol: self.protocol,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.address_family
            .unwrap_or_else(|| AddressFamily::of(&self.vip))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn route(&self) -> Option<DynamicRoute> {
        self.bgp.as_ref().map(|bgp| DynamicRoute {
            local_asn: bgp.local_asn,
            peer_asn: bgp.peer_asn,
            community: bgp.community.clone(),
            prefix: bgp.prefix.unwrap_or_else(|| IpNet::from(self.vip)),
            hold_time_ms: bgp.hold_time_ms,
        })
    }

    fn validate(&self) -> Result<()> {
        let id = self.id();
        let invalid =
            |reason: String| -> Result<()> { Err(LbError::Config(format!("balancer {}: {}", id, reason))) };

        if self.name.is_empty() {
            return invalid("name is required".into());
        }
        if self.port == 0 {
            return invalid("port is required".into());
        }
        if self.scheduler.is_empty() {
            return invalid("scheduler is required".into());
        }
        if self.weight_up == 0 {
            return invalid("weight_up must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.announce_limit_ratio) {
            return invalid(format!(
                "announce_limit_ratio {} is outside [0, 1]",
                self.announce_limit_ratio
            ));
        }
        if self.health_check.rise == 0 || self.health_check.fall == 0 {
            return invalid("health check rise and fall must be positive".into());
        }
        if let Some(route) = self.route() {
            if route.local_asn == 0 || route.peer_asn == 0 {
                return invalid("bgp asns are required".into());
            }
            if route.prefix != route.prefix.trunc() {
                return invalid(format!(
                    "route prefix {} has host bits set, use {}",
                    route.prefix,
                    route.prefix.trunc()
                ));
            }
            if !route.prefix.contains(&self.vip) {
                return invalid(format!("route prefix {} does not cover the vip", route.prefix));
            }
        }

        build_discovery(&self.discovery, self.port).map_err(|e| LbError::Config(format!("balancer {}: {}", id, e)))?;
        build_checker(&self.health_check.check).map_err(|e| LbError::Config(format!("balancer {}: {}", id, e)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Interface the VIPs are configured on
    #[serde(default = "default_link_interface")]
    pub link_interface: String,
    #[serde(default)]
    pub fwmark: FwmarkPoolConfig,
    #[serde(default)]
    pub balancers: Vec<BalancerConfig>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            sync_interval_ms: default_sync_interval_ms(),
            link_interface: default_link_interface(),
            fwmark: FwmarkPoolConfig::default(),
            balancers: Vec::new(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| LbError::Config(e.to_string()))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    /// Check the whole configuration; nothing is applied if this fails
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(LbError::Config("sync_interval_ms must be positive".into()));
        }
        if self.link_interface.is_empty() {
            return Err(LbError::Config("link_interface is required".into()));
        }

        let mut services = HashSet::new();
        let mut fwmark_by_vip: HashMap<IpAddr, (bool, &str)> = HashMap::new();

        for balancer in &self.balancers {
            balancer.validate()?;

            if !services.insert(balancer.service_key()) {
                return Err(LbError::Config(format!(
                    "duplicate service {} (balancer {})",
                    balancer.service_key(),
                    balancer.name
                )));
            }

            match fwmark_by_vip.get(&balancer.vip) {
                Some((enabled, other)) if *enabled != balancer.fwmark => {
                    return Err(LbError::Config(format!(
                        "balancers {} and {} share vip {} but disagree on fwmark",
                        other, balancer.name, balancer.vip
                    )));
                }
                Some(_) => {}
                None => {
                    fwmark_by_vip.insert(balancer.vip, (balancer.fwmark, balancer.name.as_str()));
                }
            }
        }

        if self.balancers.iter().any(|b| b.fwmark) && self.fwmark.size == 0 {
            return Err(LbError::Config("fwmark pool is empty".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(name: &str, vip: &str, port: u16) -> BalancerConfig {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "vip": vip,
            "port": port,
            "discovery": { "type": "static", "hosts": ["h1", "h2"] },
            "health_check": { "check": { "type": "dummy" } }
        }))
        .unwrap()
    }

    fn config(balancers: Vec<BalancerConfig>) -> ControlPlaneConfig {
        ControlPlaneConfig {
            balancers,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_from_json() {
        let b = balancer("svc-a", "10.0.0.1", 443);
        assert_eq!(b.protocol, Protocol::Tcp);
        assert_eq!(b.scheduler, "wrr");
        assert_eq!(b.weight_up, 1000);
        assert_eq!(b.retry_delay_ms, 5000);
        assert_eq!(b.family(), AddressFamily::Inet);
        assert_eq!(b.id().to_string(), "svc-a@tcp://10.0.0.1:443");
        assert!(b.route().is_none());

        let cfg = ControlPlaneConfig::from_json("{}").unwrap();
        assert_eq!(cfg.sync_interval_ms, 10_000);
        assert_eq!(cfg.link_interface, "lo");
    }

    #[test]
    fn test_route_defaults_to_host_prefix() {
        let mut b = balancer("svc-a", "10.0.0.1", 443);
        b.bgp = Some(RouteConfig {
            local_asn: 65000,
            peer_asn: 65001,
            community: "65000:100".into(),
            prefix: None,
            hold_time_ms: 3000,
        });
        let route = b.route().unwrap();
        assert_eq!(route.prefix.to_string(), "10.0.0.1/32");
        assert_eq!(route.hold_time_ms, 3000);
        assert!(config(vec![b]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_balancers() {
        let mut b = balancer("svc-a", "10.0.0.1", 443);
        b.weight_up = 0;
        assert!(config(vec![b]).validate().is_err());

        let mut b = balancer("svc-a", "10.0.0.1", 443);
        b.announce_limit_ratio = 1.5;
        assert!(config(vec![b]).validate().is_err());

        let b = balancer("", "10.0.0.1", 443);
        assert!(config(vec![b]).validate().is_err());

        let mut b = balancer("svc-a", "10.0.0.1", 443);
        b.bgp = Some(RouteConfig {
            local_asn: 65000,
            peer_asn: 65001,
            community: String::new(),
            prefix: Some("10.9.0.0/24".parse().unwrap()),
            hold_time_ms: 0,
        });
        assert!(config(vec![b]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_canonical_prefix() {
        let with_prefix = |prefix: &str| {
            let mut b = balancer("svc-a", "10.0.0.1", 443);
            b.bgp = Some(RouteConfig {
                local_asn: 65000,
                peer_asn: 65001,
                community: String::new(),
                prefix: Some(prefix.parse().unwrap()),
                hold_time_ms: 0,
            });
            config(vec![b])
        };

        // The RIB reports 10.0.0.0/24, which would never match
        assert!(with_prefix("10.0.0.1/24").validate().is_err());
        assert!(with_prefix("10.0.0.0/24").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_service() {
        let a = balancer("svc-a", "10.0.0.1", 443);
        let b = balancer("svc-b", "10.0.0.1", 443);
        assert!(config(vec![a.clone(), b]).validate().is_err());

        let mut udp = balancer("svc-a", "10.0.0.1", 443);
        udp.protocol = Protocol::Udp;
        assert!(config(vec![a, udp]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_fwmark() {
        let mut a = balancer("svc-a", "10.0.0.1", 443);
        a.fwmark = true;
        let b = balancer("svc-b", "10.0.0.1", 80);
        assert!(config(vec![a.clone(), b]).validate().is_err());

        let mut c = balancer("svc-c", "10.0.0.1", 80);
        c.fwmark = true;
        let mut cfg = config(vec![a, c]);
        assert!(cfg.validate().is_ok());

        cfg.fwmark.size = 0;
        assert!(cfg.validate().is_err());
    }
}
