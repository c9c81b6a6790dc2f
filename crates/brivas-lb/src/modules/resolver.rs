//! DNS-backed naming cache

use async_trait::async_trait;
use brivas_core::{AddressFamily, ServiceKey};
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use super::ResolverModule;
use crate::error::{LbError, Result};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CachedAddress {
    address: IpAddr,
    resolved_at: Instant,
}

/// Forward lookups through the system resolver, cached per host and
/// family. Reverse names come from what was resolved forward.
#[derive(Debug)]
pub struct CachingResolver {
    cluster: String,
    timeout: Duration,
    ttl: Duration,
    forward: DashMap<(String, AddressFamily), CachedAddress>,
    reverse: DashMap<IpAddr, String>,
    services: DashMap<ServiceKey, String>,
}

impl CachingResolver {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self::with_timeouts(cluster, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_CACHE_TTL)
    }

    pub fn with_timeouts(cluster: impl Into<String>, timeout: Duration, ttl: Duration) -> Self {
        Self {
            cluster: cluster.into(),
            timeout,
            ttl,
            forward: DashMap::new(),
            reverse: DashMap::new(),
            services: DashMap::new(),
        }
    }

    async fn resolve(&self, host: &str, family: AddressFamily) -> Result<IpAddr> {
        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| LbError::Resolve {
                host: host.to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            })?
            .map_err(|e| LbError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let mut candidates: Vec<IpAddr> = addrs.map(|a| a.ip()).filter(|ip| family.matches(ip)).collect();
        // Stable choice across lookups
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| LbError::Resolve {
            host: host.to_string(),
            reason: format!("no {} address", family),
        })
    }
}

#[async_trait]
impl ResolverModule for CachingResolver {
    async fn lookup(&self, host: &str, family: AddressFamily) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if !family.matches(&ip) {
                return Err(LbError::Resolve {
                    host: host.to_string(),
                    reason: format!("literal is not {}", family),
                });
            }
            return Ok(ip);
        }

        let cache_key = (host.to_string(), family);
        if let Some(cached) = self.forward.get(&cache_key) {
            if cached.resolved_at.elapsed() < self.ttl {
                return Ok(cached.address);
            }
        }

        let address = self.resolve(host, family).await?;
        debug!(host, %address, "Resolved host");
        self.forward.insert(
            cache_key,
            CachedAddress {
                address,
                resolved_at: Instant::now(),
            },
        );
        self.reverse.insert(address, host.to_string());
        Ok(address)
    }

    async fn reverse_lookup(&self, address: IpAddr) -> Option<String> {
        self.reverse.get(&address).map(|n| n.value().clone())
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

#[cfg(test)]
mod tests {
    use super::*;
    use brivas_core::Protocol;

    #[tokio::test]
    async fn test_literals_bypass_dns() {
        let resolver = CachingResolver::new("test");
        let ip = resolver.lookup("10.1.0.1", AddressFamily::Inet).await.unwrap();
        assert_eq!(ip, "10.1.0.1".parse::<IpAddr>().unwrap());
        assert!(resolver.lookup("10.1.0.1", AddressFamily::Inet6).await.is_err());
    }

    #[tokio::test]
    async fn test_localhost_is_cached_for_reverse() {
        let resolver = CachingResolver::new("test");
        let ip = resolver.lookup("localhost", AddressFamily::Inet).await.unwrap();
        assert!(ip.is_loopback());
        assert_eq!(resolver.reverse_lookup(ip).await, Some("localhost".to_string()));
    }

    #[test]
    fn test_service_registry() {
        let resolver = CachingResolver::new("edge-1");
        let key = ServiceKey::Tuple {
            vip: "10.0.0.1".parse().unwrap(),
            port: 443,
            protocol: Protocol::Tcp,
        };
        assert_eq!(resolver.service_lookup(&key), None);
        resolver.register_service(key, "svc-a");
        assert_eq!(resolver.service_lookup(&key).as_deref(), Some("svc-a"));
        assert_eq!(resolver.cluster(), "edge-1");
    }
}
