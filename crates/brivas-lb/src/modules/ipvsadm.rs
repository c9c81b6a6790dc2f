//! IPVS through the `ipvsadm` tool
//!
//! State is read back from the save format (`ipvsadm -S -n`), counters
//! from `ipvsadm -L -n --stats --exact`.

use async_trait::async_trait;
use brivas_core::{AddressFamily, ForwardMethod, Protocol, ServiceKey, UpstreamState};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

use super::command::CommandRunner;
use super::{IpvsModule, IpvsService, ServiceStats};
use crate::error::{LbError, Result};
use crate::stats::TrafficCounters;

/// A service parsed from the save format, with its reals
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SavedService {
    pub service: IpvsService,
    pub reals: Vec<UpstreamState>,
}

pub struct IpvsAdm {
    runner: CommandRunner,
}

impl IpvsAdm {
    pub fn new(timeout: Duration) -> Self {
        Self::with_binary("ipvsadm", timeout)
    }

    pub fn with_binary(binary: &str, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new(binary, timeout),
        }
    }

    async fn saved(&self) -> Result<Vec<SavedService>> {
        let output = self.runner.run(&["-S", "-n"]).await?;
        parse_save(&output)
    }

    async fn each_real(&self, flag: &str, key: &ServiceKey, reals: &[UpstreamState], with_weight: bool) -> Result<()> {
        for real in reals {
            let mut args = vec![flag.to_string()];
            args.extend(service_args(key));
            args.push("-r".into());
            args.push(real.key().to_string());
            if with_weight {
                args.push(forward_flag(real.forward_method).into());
                args.push("-w".into());
                args.push(real.weight.to_string());
            }
            self.runner.run(&args).await?;
        }
        Ok(())
    }
}

/// `-t vip:port`, `-u vip:port` or `-f mark [-6]`
pub(crate) fn service_args(key: &ServiceKey) -> Vec<String> {
    match key {
        ServiceKey::Tuple { vip, port, protocol } => {
            let flag = match protocol {
                Protocol::Tcp => "-t",
                Protocol::Udp => "-u",
            };
            vec![flag.into(), SocketAddr::new(*vip, *port).to_string()]
        }
        ServiceKey::Fwmark { mark, family } => {
            let mut args = vec!["-f".to_string(), mark.to_string()];
            if *family == AddressFamily::Inet6 {
                args.push("-6".into());
            }
            args
        }
    }
}

fn forward_flag(method: ForwardMethod) -> &'static str {
    match method {
        ForwardMethod::Tunnel => "-i",
        ForwardMethod::Masquerade => "-m",
    }
}

fn parse_error(line: &str, reason: &str) -> LbError {
    LbError::Ipvs(format!("cannot parse {:?}: {}", line, reason))
}

fn parse_service_key(line: &str, flag: &str, value: &str, inet6: bool) -> Result<ServiceKey> {
    match flag {
        "-t" | "-u" => {
            let addr: SocketAddr = value.parse().map_err(|_| parse_error(line, "bad service address"))?;
            Ok(ServiceKey::Tuple {
                vip: addr.ip(),
                port: addr.port(),
                protocol: if flag == "-t" { Protocol::Tcp } else { Protocol::Udp },
            })
        }
        "-f" => Ok(ServiceKey::Fwmark {
            mark: value.parse().map_err(|_| parse_error(line, "bad fwmark"))?,
            family: if inet6 {
                AddressFamily::Inet6
            } else {
                AddressFamily::Inet
            },
        }),
        _ => Err(parse_error(line, "unsupported service type")),
    }
}

/// Parse `ipvsadm -S -n` output. Services with direct-routing reals were
/// set up by someone else and are left out.
pub(crate) fn parse_save(output: &str) -> Result<Vec<SavedService>> {
    let mut services: Vec<SavedService> = Vec::new();
    let mut unmanaged: HashSet<ServiceKey> = HashSet::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let inet6 = tokens.contains(&"-6");

        let mut service_flag = None;
        let mut scheduler = None;
        let mut real = None;
        let mut forward = None;
        let mut weight = None;
        let mut direct = false;

        let mut i = 1;
        while i < tokens.len() {
            let value = tokens.get(i + 1).copied();
            match tokens[i] {
                "-t" | "-u" | "-f" => {
                    service_flag = Some((tokens[i], value.ok_or_else(|| parse_error(line, "missing service"))?));
                    i += 1;
                }
                "-s" => {
                    scheduler = value;
                    i += 1;
                }
                "-r" => {
                    real = value;
                    i += 1;
                }
                "-w" => {
                    weight = value;
                    i += 1;
                }
                "-i" => forward = Some(ForwardMethod::Tunnel),
                "-m" => forward = Some(ForwardMethod::Masquerade),
                "-g" => direct = true,
                // Flags with a value we do not track
                "-x" | "-y" | "-M" | "-b" | "--pe" => i += 1,
                "-p" if value.is_some_and(|v| !v.starts_with('-')) => i += 1,
                _ => {}
            }
            i += 1;
        }

        let (flag, value) = service_flag.ok_or_else(|| parse_error(line, "no service"))?;
        let key = parse_service_key(line, flag, value, inet6)?;

        if unmanaged.contains(&key) {
            continue;
        }
        if direct {
            warn!(service = %key, "Ignoring service with direct routing reals");
            services.retain(|s| s.service.key != key);
            unmanaged.insert(key);
            continue;
        }

        match tokens[0] {
            "-A" => services.push(SavedService {
                service: IpvsService {
                    key,
                    scheduler: scheduler.unwrap_or(brivas_core::DEFAULT_SCHEDULER).to_string(),
                },
                reals: Vec::new(),
            }),
            "-a" => {
                let addr: SocketAddr = real
                    .ok_or_else(|| parse_error(line, "missing real server"))?
                    .parse()
                    .map_err(|_| parse_error(line, "bad real server address"))?;
                let weight = weight
                    .map(|w| w.parse::<u32>())
                    .transpose()
                    .map_err(|_| parse_error(line, "bad weight"))?
                    .unwrap_or(1);
                let service = services
                    .iter_mut()
                    .find(|s| s.service.key == key)
                    .ok_or_else(|| parse_error(line, "real server before its service"))?;
                service.reals.push(UpstreamState {
                    hostname: String::new(),
                    address: addr.ip(),
                    port: addr.port(),
                    weight,
                    forward_method: forward.unwrap_or_default(),
                });
            }
            _ => return Err(parse_error(line, "unknown command")),
        }
    }

    Ok(services)
}

fn parse_counters(tokens: &[&str]) -> Option<TrafficCounters> {
    if tokens.len() < 5 {
        return None;
    }
    let tail = &tokens[tokens.len() - 5..];
    let mut values = [0u64; 5];
    for (slot, token) in values.iter_mut().zip(tail) {
        *slot = token.parse().ok()?;
    }
    Some(TrafficCounters {
        connections: values[0],
        packets_in: values[1],
        packets_out: values[2],
        bytes_in: values[3],
        bytes_out: values[4],
    })
}

/// Parse `ipvsadm -L -n --stats --exact` output
pub(crate) fn parse_stats(output: &str) -> Vec<ServiceStats> {
    let mut stats: Vec<ServiceStats> = Vec::new();
    // Reals of a service we cannot key (e.g. SCTP) are skipped with it
    let mut current = false;

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = tokens.first() else { continue };

        match *first {
            "TCP" | "UDP" | "FWM" => {
                current = false;
                let (Some(addr), Some(counters)) = (tokens.get(1), parse_counters(&tokens)) else {
                    continue;
                };
                let key = match *first {
                    "FWM" => addr.parse().ok().map(|mark| ServiceKey::Fwmark {
                        mark,
                        family: if tokens.contains(&"IPv6") {
                            AddressFamily::Inet6
                        } else {
                            AddressFamily::Inet
                        },
                    }),
                    proto => addr.parse::<SocketAddr>().ok().map(|a| ServiceKey::Tuple {
                        vip: a.ip(),
                        port: a.port(),
                        protocol: if proto == "TCP" { Protocol::Tcp } else { Protocol::Udp },
                    }),
                };
                if let Some(key) = key {
                    stats.push(ServiceStats {
                        key,
                        counters,
                        reals: Vec::new(),
                    });
                    current = true;
                }
            }
            "->" if current => {
                let parsed = tokens
                    .get(1)
                    .and_then(|a| a.parse::<SocketAddr>().ok())
                    .zip(parse_counters(&tokens));
                if let (Some((addr, counters)), Some(service)) = (parsed, stats.last_mut()) {
                    service.reals.push((addr, counters));
                }
            }
            _ => current = false,
        }
    }

    stats
}

#[async_trait]
impl IpvsModule for IpvsAdm {
    async fn add_service(&self, key: &ServiceKey, scheduler: &str) -> Result<()> {
        let mut args = vec!["-A".to_string()];
        args.extend(service_args(key));
        args.extend(["-s".to_string(), scheduler.to_string()]);
        self.runner.run(&args).await.map(|_| ())
    }

    async fn update_service(&self, key: &ServiceKey, scheduler: &str) -> Result<()> {
        let mut args = vec!["-E".to_string()];
        args.extend(service_args(key));
        args.extend(["-s".to_string(), scheduler.to_string()]);
        self.runner.run(&args).await.map(|_| ())
    }

    async fn delete_service(&self, key: &ServiceKey) -> Result<()> {
        let mut args = vec!["-D".to_string()];
        args.extend(service_args(key));
        self.runner.run(&args).await.map(|_| ())
    }

    async fn list_services(&self) -> Result<Vec<IpvsService>> {
        Ok(self.saved().await?.into_iter().map(|s| s.service).collect())
    }

    async fn get_real_servers(&self, key: &ServiceKey) -> Result<Vec<UpstreamState>> {
        self.saved()
            .await?
            .into_iter()
            .find(|s| s.service.key == *key)
            .map(|s| s.reals)
            .ok_or_else(|| LbError::Ipvs(format!("no service {}", key)))
    }

    async fn add_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()> {
        self.each_real("-a", key, reals, true).await
    }

    async fn update_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()> {
        self.each_real("-e", key, reals, true).await
    }

    async fn delete_real_servers(&self, key: &ServiceKey, reals: &[UpstreamState]) -> Result<()> {
        self.each_real("-d", key, reals, false).await
    }

    async fn stats(&self) -> Result<Vec<ServiceStats>> {
        let output = self.runner.run(&["-L", "-n", "--stats", "--exact"]).await?;
        Ok(parse_stats(&output))
    }
}
