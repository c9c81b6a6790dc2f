//! Load balancer domain types shared by the control and data planes

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{BrivasError, Result};

/// Default IPVS scheduler for weighted round robin
pub const DEFAULT_SCHEDULER: &str = "wrr";

fn default_scheduler() -> String {
    DEFAULT_SCHEDULER.to_string()
}

/// Transport protocol of a virtual service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet => f.write_str("inet"),
            Self::Inet6 => f.write_str("inet6"),
        }
    }
}

/// How the kernel forwards packets to a real server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMethod {
    /// IP-in-IP encapsulation
    Tunnel,
    /// NAT
    Masquerade,
}

impl Default for ForwardMethod {
    fn default() -> Self {
        Self::Tunnel
    }
}

/// Identity of one kernel LB service.
///
/// Always derived from balancer configuration or from an allocated fwmark,
/// never configured directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServiceKey {
    Tuple {
        vip: IpAddr,
        port: u16,
        protocol: Protocol,
    },
    Fwmark {
        mark: u32,
        family: AddressFamily,
    },
}

impl ServiceKey {
    pub fn family(&self) -> AddressFamily {
        match self {
            Self::Tuple { vip, .. } => AddressFamily::of(vip),
            Self::Fwmark { family, .. } => *family,
        }
    }

    pub fn vip(&self) -> Option<IpAddr> {
        match self {
            Self::Tuple { vip, .. } => Some(*vip),
            Self::Fwmark { .. } => None,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tuple { vip, port, protocol } => {
                write!(f, "{}://{}", protocol, SocketAddr::new(*vip, *port))
            }
            Self::Fwmark { mark, .. } => write!(f, "fwmark://{}", mark),
        }
    }
}

/// One real server behind a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamState {
    /// Display name; not part of the kernel state
    #[serde(default)]
    pub hostname: String,
    pub address: IpAddr,
    pub port: u16,
    /// 0 = down; larger values only matter for weighted schedulers
    pub weight: u32,
    #[serde(default)]
    pub forward_method: ForwardMethod,
}

impl UpstreamState {
    pub fn key(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.weight > 0
    }

    /// Equality as far as the kernel is concerned (hostname ignored).
    pub fn kernel_equal(&self, other: &Self) -> bool {
        self.address == other.address
            && self.port == other.port
            && self.weight == other.weight
            && self.forward_method == other.forward_method
    }
}

/// Immutable snapshot of one kernel LB service and its upstreams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerState {
    pub name: String,
    pub key: ServiceKey,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default)]
    pub upstreams: Vec<UpstreamState>,
}

impl BalancerState {
    pub fn new(name: impl Into<String>, key: ServiceKey, upstreams: Vec<UpstreamState>) -> Self {
        Self {
            name: name.into(),
            key,
            scheduler: default_scheduler(),
            upstreams,
        }
    }

    pub fn healthy_upstreams(&self) -> usize {
        self.upstreams.iter().filter(|u| u.is_up()).count()
    }
}

/// BGP announcement for a VIP prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynamicRoute {
    pub local_asn: u32,
    pub peer_asn: u32,
    #[serde(default)]
    pub community: String,
    pub prefix: IpNet,
    #[serde(default)]
    pub hold_time_ms: u64,
}

impl DynamicRoute {
    pub fn hold_time(&self) -> Duration {
        Duration::from_millis(self.hold_time_ms)
    }
}

/// Address configured on a local interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkAddress {
    pub interface: String,
    pub address: IpAddr,
}

/// Full desired (or live) state of the data plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPlaneState {
    #[serde(default)]
    pub balancers: Vec<BalancerState>,
    #[serde(default)]
    pub dynamic_routes: Vec<DynamicRoute>,
    #[serde(default)]
    pub link_addresses: Vec<LinkAddress>,
}

impl DataPlaneState {
    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty() && self.dynamic_routes.is_empty() && self.link_addresses.is_empty()
    }

    pub fn balancer(&self, key: &ServiceKey) -> Option<&BalancerState> {
        self.balancers.iter().find(|b| b.key == *key)
    }

    /// Reject states that would make the diff ambiguous.
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for balancer in &self.balancers {
            if !keys.insert(balancer.key) {
                return Err(BrivasError::Validation(format!(
                    "duplicate service key {}",
                    balancer.key
                )));
            }
            if balancer.scheduler.is_empty() {
                return Err(BrivasError::Validation(format!(
                    "service {} has no scheduler",
                    balancer.key
                )));
            }
        }

        let mut addresses = HashSet::new();
        for link in &self.link_addresses {
            if link.interface.is_empty() {
                return Err(BrivasError::Validation(format!(
                    "link address {} has no interface",
                    link.address
                )));
            }
            if !addresses.insert(link.address) {
                return Err(BrivasError::Validation(format!(
                    "duplicate link address {}",
                    link.address
                )));
            }
        }

        let mut prefixes = HashSet::new();
        for route in &self.dynamic_routes {
            if !prefixes.insert(route.prefix) {
                return Err(BrivasError::Validation(format!(
                    "duplicate route prefix {}",
                    route.prefix
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(vip: &str, port: u16) -> ServiceKey {
        ServiceKey::Tuple {
            vip: vip.parse().unwrap(),
            port,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_service_key_display() {
        assert_eq!(tuple("10.0.0.1", 443).to_string(), "tcp://10.0.0.1:443");
        assert_eq!(tuple("2001:db8::1", 80).to_string(), "tcp://[2001:db8::1]:80");
        let mark = ServiceKey::Fwmark {
            mark: 5000,
            family: AddressFamily::Inet,
        };
        assert_eq!(mark.to_string(), "fwmark://5000");
        assert_eq!(mark.vip(), None);
    }

    #[test]
    fn test_service_key_serde_is_tagged() {
        let json = serde_json::to_value(tuple("10.0.0.1", 443)).unwrap();
        assert_eq!(json["kind"], "tuple");
        assert_eq!(json["protocol"], "tcp");

        let unknown = serde_json::json!({ "kind": "sctp", "vip": "10.0.0.1" });
        assert!(serde_json::from_value::<ServiceKey>(unknown).is_err());
    }

    #[test]
    fn test_kernel_equal_ignores_hostname() {
        let a = UpstreamState {
            hostname: "h1".into(),
            address: "10.1.0.1".parse().unwrap(),
            port: 443,
            weight: 1000,
            forward_method: ForwardMethod::Tunnel,
        };
        let b = UpstreamState {
            hostname: String::new(),
            ..a.clone()
        };
        assert!(a.kernel_equal(&b));
        assert_ne!(a, b);

        let c = UpstreamState { weight: 0, ..a.clone() };
        assert!(!a.kernel_equal(&c));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut state = DataPlaneState {
            balancers: vec![
                BalancerState::new("a", tuple("10.0.0.1", 443), vec![]),
                BalancerState::new("b", tuple("10.0.0.1", 443), vec![]),
            ],
            ..Default::default()
        };
        assert!(state.validate().is_err());

        state.balancers.pop();
        state.link_addresses = vec![
            LinkAddress {
                interface: "lo".into(),
                address: "10.0.0.1".parse().unwrap(),
            },
            LinkAddress {
                interface: "dummy0".into(),
                address: "10.0.0.1".parse().unwrap(),
            },
        ];
        assert!(state.validate().is_err());

        state.link_addresses.pop();
        assert!(state.validate().is_ok());
    }
}
