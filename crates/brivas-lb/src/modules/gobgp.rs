//! BGP speaker through the `gobgp` CLI
//!
//! The global RIB only tells us which prefixes are announced; the
//! attributes a route was announced with are remembered locally so that
//! listing returns what was advertised. Paths learned from peers are not
//! ours and never listed.

use async_trait::async_trait;
use brivas_core::DynamicRoute;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::command::CommandRunner;
use super::BgpModule;
use crate::error::{LbError, Result};

/// BGP FSM state number of ESTABLISHED in gobgp's API
const SESSION_ESTABLISHED: u64 = 6;

/// Hold time of a live route whose attributes were lost with a restart
pub const DEFAULT_HOLD_TIME: Duration = Duration::from_secs(5);

fn afi(prefix: &IpNet) -> &'static str {
    match prefix {
        IpNet::V4(_) => "ipv4",
        IpNet::V6(_) => "ipv6",
    }
}

/// Locally originated paths carry no neighbor, or the speaker itself
fn is_local_path(path: &Value, router_id: IpAddr) -> bool {
    let neighbor = match path.get("neighbor-ip").and_then(Value::as_str) {
        Some(neighbor) => neighbor,
        None => return true,
    };
    if neighbor.is_empty() || neighbor == "<nil>" {
        return true;
    }
    match neighbor.parse::<IpAddr>() {
        Ok(addr) => addr.is_unspecified() || addr == router_id,
        Err(_) => false,
    }
}

/// Prefixes of `gobgp global rib -j` with at least one local path
pub(crate) fn parse_rib(output: &str, router_id: IpAddr) -> Result<Vec<IpNet>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let rib: Value = serde_json::from_str(trimmed)
        .map_err(|e| LbError::Bgp(format!("cannot parse rib: {}", e)))?;
    let table = rib
        .as_object()
        .ok_or_else(|| LbError::Bgp("rib is not an object".into()))?;

    let mut prefixes = Vec::with_capacity(table.len());
    for (prefix, paths) in table {
        let local = match paths.as_array() {
            Some(paths) => paths.iter().any(|p| is_local_path(p, router_id)),
            None => false,
        };
        if !local {
            debug!(prefix = %prefix, "Skipping peer-learned prefix");
            continue;
        }
        prefixes.push(
            prefix
                .parse::<IpNet>()
                .map_err(|_| LbError::Bgp(format!("bad prefix {:?} in rib", prefix)))?,
        );
    }
    Ok(prefixes)
}

/// Whether any neighbor of `gobgp neighbor -j` is established
pub(crate) fn parse_neighbors(output: &str) -> Result<bool> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(false);
    }
    let neighbors: Value = serde_json::from_str(trimmed)
        .map_err(|e| LbError::Bgp(format!("cannot parse neighbors: {}", e)))?;
    let neighbors = neighbors
        .as_array()
        .ok_or_else(|| LbError::Bgp("neighbor list is not an array".into()))?;

    Ok(neighbors.iter().any(|n| match &n["state"]["session_state"] {
        Value::Number(state) => state.as_u64() == Some(SESSION_ESTABLISHED),
        Value::String(state) => state.eq_ignore_ascii_case("established"),
        _ => false,
    }))
}

pub struct GoBgp {
    runner: CommandRunner,
    router_id: IpAddr,
    local_asn: Mutex<Option<u32>>,
    announced: DashMap<IpNet, DynamicRoute>,
    default_hold_time: Duration,
}

impl GoBgp {
    pub fn new(router_id: IpAddr, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new("gobgp", timeout),
            router_id,
            local_asn: Mutex::new(None),
            announced: DashMap::new(),
            default_hold_time: DEFAULT_HOLD_TIME,
        }
    }

    /// Hold time reported for live routes announced before a restart
    pub fn with_default_hold_time(mut self, hold_time: Duration) -> Self {
        if !hold_time.is_zero() {
            self.default_hold_time = hold_time;
        }
        self
    }

    fn unknown_route(&self, prefix: IpNet, local_asn: u32) -> DynamicRoute {
        DynamicRoute {
            local_asn,
            peer_asn: 0,
            community: String::new(),
            prefix,
            hold_time_ms: self.default_hold_time.as_millis() as u64,
        }
    }
}

#[async_trait]
impl BgpModule for GoBgp {
    async fn init(&self, local_asn: u32) -> Result<()> {
        let asn = local_asn.to_string();
        let router_id = self.router_id.to_string();
        self.runner
            .run(&["global", "as", asn.as_str(), "router-id", router_id.as_str()])
            .await?;
        *self.local_asn.lock() = Some(local_asn);
        info!(local_asn, router_id = %self.router_id, "BGP speaker initialised");
        Ok(())
    }

    async fn advertise(&self, route: &DynamicRoute) -> Result<()> {
        let prefix = route.prefix.to_string();
        let mut args = vec!["global", "rib", "add", prefix.as_str()];
        if !route.community.is_empty() {
            args.extend(["community", route.community.as_str()]);
        }
        args.extend(["-a", afi(&route.prefix)]);
        self.runner.run(&args).await?;
        self.announced.insert(route.prefix, route.clone());
        Ok(())
    }

    async fn withdraw(&self, route: &DynamicRoute) -> Result<()> {
        let prefix = route.prefix.to_string();
        self.runner
            .run(&["global", "rib", "del", prefix.as_str(), "-a", afi(&route.prefix)])
            .await?;
        self.announced.remove(&route.prefix);
        Ok(())
    }

    async fn list_paths(&self) -> Result<Vec<DynamicRoute>> {
        let local_asn = self.local_asn.lock().unwrap_or_default();
        let mut routes = Vec::new();
        for family in ["ipv4", "ipv6"] {
            let output = self.runner.run(&["global", "rib", "-a", family, "-j"]).await?;
            for prefix in parse_rib(&output, self.router_id)? {
                let route = match self.announced.get(&prefix) {
                    Some(known) => known.value().clone(),
                    // Announced before a restart
                    None => self.unknown_route(prefix, local_asn),
                };
                routes.push(route);
            }
        }
        Ok(routes)
    }

    async fn is_session_established(&self) -> Result<bool> {
        let output = self.runner.run(&["neighbor", "-j"]).await?;
        parse_neighbors(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_id() -> IpAddr {
        "192.0.2.10".parse().unwrap()
    }

    #[test]
    fn test_parse_rib() {
        let output = r#"{"10.0.0.1/32":[{"nlri":{"prefix":"10.0.0.1/32"},"age":12,"best":true,"source-id":"<nil>","neighbor-ip":"<nil>"}],
                         "10.0.1.0/24":[{"nlri":{"prefix":"10.0.1.0/24"},"age":3,"best":true,"neighbor-ip":"192.0.2.10"}]}"#;
        let mut prefixes = parse_rib(output, router_id()).unwrap();
        prefixes.sort();
        assert_eq!(
            prefixes,
            vec![
                "10.0.0.1/32".parse::<IpNet>().unwrap(),
                "10.0.1.0/24".parse::<IpNet>().unwrap()
            ]
        );

        assert!(parse_rib("", router_id()).unwrap().is_empty());
        assert!(parse_rib("{}", router_id()).unwrap().is_empty());
        assert!(parse_rib(r#"{"bogus":[{}]}"#, router_id()).is_err());
    }

    #[test]
    fn test_parse_rib_skips_peer_paths() {
        let output = r#"{"0.0.0.0/0":[{"nlri":{"prefix":"0.0.0.0/0"},"source-id":"192.0.2.1","neighbor-ip":"192.0.2.1"}],
                         "10.0.0.1/32":[{"nlri":{"prefix":"10.0.0.1/32"},"neighbor-ip":"0.0.0.0"}],
                         "10.0.2.0/24":[{"neighbor-ip":"192.0.2.1"},{"neighbor-ip":"<nil>"}]}"#;
        let mut prefixes = parse_rib(output, router_id()).unwrap();
        prefixes.sort();
        assert_eq!(
            prefixes,
            vec![
                "10.0.0.1/32".parse::<IpNet>().unwrap(),
                "10.0.2.0/24".parse::<IpNet>().unwrap()
            ]
        );
    }

    #[test]
    fn test_unknown_route_keeps_hold_time() {
        let prefix: IpNet = "10.0.0.1/32".parse().unwrap();

        let bgp = GoBgp::new(router_id(), Duration::from_secs(1));
        let route = bgp.unknown_route(prefix, 65000);
        assert_eq!(route.hold_time(), DEFAULT_HOLD_TIME);
        assert_eq!(route.local_asn, 65000);

        let bgp = GoBgp::new(router_id(), Duration::from_secs(1)).with_default_hold_time(Duration::from_millis(1500));
        assert_eq!(bgp.unknown_route(prefix, 65000).hold_time_ms, 1500);

        let bgp = GoBgp::new(router_id(), Duration::from_secs(1)).with_default_hold_time(Duration::ZERO);
        assert_eq!(bgp.unknown_route(prefix, 65000).hold_time(), DEFAULT_HOLD_TIME);
    }

    #[test]
    fn test_parse_neighbors() {
        let established = r#"[{"conf":{"neighbor_address":"192.0.2.1"},"state":{"session_state":6}}]"#;
        assert!(parse_neighbors(established).unwrap());

        let legacy = r#"[{"state":{"session_state":"ESTABLISHED"}}]"#;
        assert!(parse_neighbors(legacy).unwrap());

        let idle = r#"[{"state":{"session_state":1}}]"#;
        assert!(!parse_neighbors(idle).unwrap());
        assert!(!parse_neighbors("null").unwrap());
    }
}
