//! Interface addresses through iproute2 (`ip -j addr`)

use async_trait::async_trait;
use brivas_core::LinkAddress;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use super::command::CommandRunner;
use super::AddressTableModule;
use crate::error::{LbError, Result};

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    local: Option<IpAddr>,
}

/// Loopback and link-local addresses are never ours to manage
fn is_managed(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local(),
        IpAddr::V6(v6) => !v6.is_loopback() && (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// Parse `ip -j addr show` output
pub(crate) fn parse_addresses(output: &str) -> Result<Vec<LinkAddress>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let links: Vec<IpLink> = serde_json::from_str(output)
        .map_err(|e| LbError::Address(format!("cannot parse ip output: {}", e)))?;

    Ok(links
        .into_iter()
        .flat_map(|link| {
            let interface = link.ifname;
            link.addr_info
                .into_iter()
                .filter_map(|info| info.local)
                .filter(is_managed)
                .map(move |address| LinkAddress {
                    interface: interface.clone(),
                    address,
                })
        })
        .collect())
}

fn host_prefix(address: &IpAddr) -> String {
    match address {
        IpAddr::V4(_) => format!("{}/32", address),
        IpAddr::V6(_) => format!("{}/128", address),
    }
}

pub struct IpRoute2 {
    runner: CommandRunner,
    /// Interface whose addresses `list` reports
    interface: String,
}

impl IpRoute2 {
    pub fn new(interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new("ip", timeout),
            interface: interface.into(),
        }
    }

    async fn addresses_on(&self, interface: &str) -> Result<Vec<LinkAddress>> {
        let output = self.runner.run(&["-j", "addr", "show", "dev", interface]).await?;
        parse_addresses(&output)
    }
}

#[async_trait]
impl AddressTableModule for IpRoute2 {
    async fn add(&self, link: &LinkAddress) -> Result<()> {
        let prefix = host_prefix(&link.address);
        self.runner
            .run(&["addr", "add", prefix.as_str(), "dev", link.interface.as_str()])
            .await
            .map(|_| ())
    }

    async fn delete(&self, link: &LinkAddress) -> Result<()> {
        let prefix = host_prefix(&link.address);
        self.runner
            .run(&["addr", "del", prefix.as_str(), "dev", link.interface.as_str()])
            .await
            .map(|_| ())
    }

    async fn is_exists(&self, link: &LinkAddress) -> Result<bool> {
        Ok(self
            .addresses_on(&link.interface)
            .await?
            .iter()
            .any(|l| l.address == link.address))
    }

    async fn list(&self) -> Result<Vec<LinkAddress>> {
        self.addresses_on(&self.interface).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses_skips_unmanaged() {
        let output = r#"[{"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP"],"addr_info":[
            {"family":"inet","local":"127.0.0.1","prefixlen":8,"scope":"host"},
            {"family":"inet","local":"10.0.0.1","prefixlen":32,"scope":"global"},
            {"family":"inet6","local":"::1","prefixlen":128,"scope":"host"},
            {"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"},
            {"family":"inet6","local":"2001:db8::1","prefixlen":128,"scope":"global"}
        ]}]"#;
        let addresses = parse_addresses(output).unwrap();
        assert_eq!(
            addresses,
            vec![
                LinkAddress {
                    interface: "lo".into(),
                    address: "10.0.0.1".parse().unwrap(),
                },
                LinkAddress {
                    interface: "lo".into(),
                    address: "2001:db8::1".parse().unwrap(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_addresses_errors() {
        assert!(parse_addresses("").unwrap().is_empty());
        assert!(parse_addresses("not json").is_err());
    }

    #[test]
    fn test_host_prefix() {
        assert_eq!(host_prefix(&"10.0.0.1".parse().unwrap()), "10.0.0.1/32");
        assert_eq!(host_prefix(&"2001:db8::1".parse().unwrap()), "2001:db8::1/128");
    }
}
