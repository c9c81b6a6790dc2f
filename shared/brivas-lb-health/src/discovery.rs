//! Real Server Discovery
//!
//! Produces the host:port candidates a balancer probes, either from a
//! static list or from DNS.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::types::{HealthError, Target};

const DNS_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a balancer finds its real servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    /// `host`, `host:port`, `[v6]:port` entries
    Static { hosts: Vec<String> },
    /// Every address the name resolves to becomes a target
    Dns {
        name: String,
        #[serde(default)]
        port: Option<u16>,
    },
}

/// Source of real server candidates
#[async_trait]
pub trait DiscoveryResolver: Send + Sync {
    async fn targets(&self) -> Result<Vec<Target>, HealthError>;

    fn describe(&self) -> String;
}

/// Build a resolver; `default_port` applies to entries without a port
pub fn build_discovery(
    config: &DiscoveryConfig,
    default_port: u16,
) -> Result<Arc<dyn DiscoveryResolver>, HealthError> {
    match config {
        DiscoveryConfig::Static { hosts } => {
            Ok(Arc::new(StaticDiscovery::parse(hosts, default_port)?))
        }
        DiscoveryConfig::Dns { name, port } => {
            if name.is_empty() {
                return Err(HealthError::Discovery("dns discovery needs a name".into()));
            }
            Ok(Arc::new(DnsDiscovery {
                name: name.clone(),
                port: port.unwrap_or(default_port),
            }))
        }
    }
}

/// Split a discovery entry into host and port
pub fn parse_target(entry: &str, default_port: u16) -> Result<Target, HealthError> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Err(HealthError::Parse("empty host entry".into()));
    }

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| HealthError::Parse(format!("unterminated '[' in {:?}", entry)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(entry, p)?,
            None if tail.is_empty() => default_port,
            None => return Err(HealthError::Parse(format!("garbage after ']' in {:?}", entry))),
        };
        return Ok(Target::new(host, port));
    }

    // Bare IPv6 literals contain ':' but carry no port
    if entry.parse::<IpAddr>().is_ok() {
        return Ok(Target::new(entry, default_port));
    }

    match entry.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok(Target::new(host, parse_port(entry, port)?)),
        Some(_) => Err(HealthError::Parse(format!("missing host in {:?}", entry))),
        None => Ok(Target::new(entry, default_port)),
    }
}

fn parse_port(entry: &str, port: &str) -> Result<u16, HealthError> {
    port.parse()
        .map_err(|_| HealthError::Parse(format!("invalid port in {:?}", entry)))
}

/// Fixed list of targets
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    targets: Vec<Target>,
}

impl StaticDiscovery {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    pub fn parse(hosts: &[String], default_port: u16) -> Result<Self, HealthError> {
        let targets = hosts
            .iter()
            .map(|h| parse_target(h, default_port))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { targets })
    }
}

#[async_trait]
impl DiscoveryResolver for StaticDiscovery {
    async fn targets(&self) -> Result<Vec<Target>, HealthError> {
        Ok(self.targets.clone())
    }

    fn describe(&self) -> String {
        format!("static({} hosts)", self.targets.len())
    }
}

/// Targets from the A/AAAA records of one name
#[derive(Debug, Clone)]
pub struct DnsDiscovery {
    name: String,
    port: u16,
}

#[async_trait]
impl DiscoveryResolver for DnsDiscovery {
    async fn targets(&self) -> Result<Vec<Target>, HealthError> {
        let addrs = tokio::time::timeout(
            DNS_DISCOVERY_TIMEOUT,
            tokio::net::lookup_host((self.name.as_str(), self.port)),
        )
        .await
        .map_err(|_| HealthError::Timeout(DNS_DISCOVERY_TIMEOUT))?
        .map_err(|e| HealthError::Discovery(format!("{}: {}", self.name, e)))?;

        // lookup_host may repeat addresses once per socket type
        let unique: BTreeSet<IpAddr> = addrs.map(|a| a.ip()).collect();
        debug!(name = %self.name, count = unique.len(), "DNS discovery resolved");

        Ok(unique
            .into_iter()
            .map(|ip| Target::new(ip.to_string(), self.port))
            .collect())
    }

    fn describe(&self) -> String {
        format!("dns({}:{})", self.name, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_forms() {
        assert_eq!(parse_target("h1", 443).unwrap(), Target::new("h1", 443));
        assert_eq!(parse_target("h1:8443", 443).unwrap(), Target::new("h1", 8443));
        assert_eq!(parse_target("10.1.0.1", 80).unwrap(), Target::new("10.1.0.1", 80));
        assert_eq!(parse_target("2001:db8::1", 80).unwrap(), Target::new("2001:db8::1", 80));
        assert_eq!(
            parse_target("[2001:db8::1]:8080", 80).unwrap(),
            Target::new("2001:db8::1", 8080)
        );
        assert_eq!(parse_target("[2001:db8::1]", 80).unwrap(), Target::new("2001:db8::1", 80));
    }

    #[test]
    fn test_parse_target_errors() {
        assert!(parse_target("", 80).is_err());
        assert!(parse_target(":80", 80).is_err());
        assert!(parse_target("h1:http", 80).is_err());
        assert!(parse_target("[::1", 80).is_err());
    }

    #[tokio::test]
    async fn test_static_discovery() {
        let discovery = build_discovery(
            &DiscoveryConfig::Static {
                hosts: vec!["h1".into(), "h2:8443".into()],
            },
            443,
        )
        .unwrap();
        let targets = discovery.targets().await.unwrap();
        assert_eq!(targets, vec![Target::new("h1", 443), Target::new("h2", 8443)]);
        assert_eq!(discovery.describe(), "static(2 hosts)");
    }
}
