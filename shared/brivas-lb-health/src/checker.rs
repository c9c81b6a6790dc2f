//! Per-protocol health checkers

use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::types::{authority, HealthCheckConfig, HealthError};

/// A probe against one real server
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `Ok(())` means healthy
    async fn check(&self, host: &str, port: u16) -> Result<(), HealthError>;

    fn configuration(&self) -> HealthCheckConfig;
}

/// Build the checker for a probe definition
pub fn build_checker(config: &HealthCheckConfig) -> Result<Arc<dyn HealthChecker>, HealthError> {
    let checker: Arc<dyn HealthChecker> = match config {
        HealthCheckConfig::Dummy => Arc::new(DummyChecker),
        HealthCheckConfig::Tcp { .. } => Arc::new(TcpChecker {
            timeout: config.timeout(),
        }),
        HealthCheckConfig::Http {
            path,
            expected_status,
            host,
            ..
        } => {
            if !path.starts_with('/') {
                return Err(HealthError::Parse(format!("http path must start with '/': {}", path)));
            }
            let client = reqwest::Client::builder()
                .timeout(config.timeout())
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| HealthError::Http(e.to_string()))?;
            Arc::new(HttpChecker {
                client,
                path: path.clone(),
                expected_status: *expected_status,
                host: host.clone(),
                timeout: config.timeout(),
            })
        }
        HealthCheckConfig::Dns { query, .. } => {
            // Validate the name once so every probe doesn't fail the same way
            encode_dns_query(0, query)?;
            Arc::new(DnsChecker {
                query: query.clone(),
                timeout: config.timeout(),
                next_id: AtomicU16::new(1),
            })
        }
        HealthCheckConfig::Syslog { .. } => Arc::new(SyslogChecker {
            timeout: config.timeout(),
        }),
    };
    Ok(checker)
}

pub struct DummyChecker;

#[async_trait]
impl HealthChecker for DummyChecker {
    async fn check(&self, _host: &str, _port: u16) -> Result<(), HealthError> {
        Ok(())
    }

    fn configuration(&self) -> HealthCheckConfig {
        HealthCheckConfig::Dummy
    }
}

pub struct TcpChecker {
    timeout: Duration,
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self, host: &str, port: u16) -> Result<(), HealthError> {
        timeout(self.timeout, TcpStream::connect(authority(host, port)))
            .await
            .map_err(|_| HealthError::Timeout(self.timeout))??;
        Ok(())
    }

    fn configuration(&self) -> HealthCheckConfig {
        HealthCheckConfig::Tcp {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

pub struct HttpChecker {
    client: reqwest::Client,
    path: String,
    expected_status: u16,
    host: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self, host: &str, port: u16) -> Result<(), HealthError> {
        let url = format!("http://{}{}", authority(host, port), self.path);
        let mut request = self.client.get(&url);
        if let Some(ref host_header) = self.host {
            request = request.header(reqwest::header::HOST, host_header.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HealthError::Timeout(self.timeout)
            } else {
                HealthError::Http(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status != self.expected_status {
            return Err(HealthError::Unhealthy(format!(
                "{} returned {}, expected {}",
                url, status, self.expected_status
            )));
        }
        Ok(())
    }

    fn configuration(&self) -> HealthCheckConfig {
        HealthCheckConfig::Http {
            path: self.path.clone(),
            expected_status: self.expected_status,
            host: self.host.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

pub struct DnsChecker {
    query: String,
    timeout: Duration,
    next_id: AtomicU16,
}

const DNS_HEADER_LEN: usize = 12;

/// Recursive A query for `name` with the given transaction id
pub(crate) fn encode_dns_query(id: u16, name: &str) -> Result<Vec<u8>, HealthError> {
    let mut packet = Vec::with_capacity(DNS_HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // AN/NS/AR

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(HealthError::Parse(format!("invalid dns name {:?}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    Ok(packet)
}

/// Check that `response` answers transaction `id` with NOERROR
pub(crate) fn verify_dns_response(id: u16, response: &[u8]) -> Result<(), HealthError> {
    if response.len() < DNS_HEADER_LEN {
        return Err(HealthError::Unhealthy("short dns response".into()));
    }
    let resp_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_id != id {
        return Err(HealthError::Unhealthy(format!(
            "dns transaction id mismatch: sent {}, got {}",
            id, resp_id
        )));
    }
    if response[2] & 0x80 == 0 {
        return Err(HealthError::Unhealthy("dns packet is not a response".into()));
    }
    let rcode = response[3] & 0x0f;
    if rcode != 0 {
        return Err(HealthError::Unhealthy(format!("dns rcode {}", rcode)));
    }
    Ok(())
}

#[async_trait]
impl HealthChecker for DnsChecker {
    async fn check(&self, host: &str, port: u16) -> Result<(), HealthError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = encode_dns_query(id, &self.query)?;

        let probe = async {
            let peer = tokio::net::lookup_host(authority(host, port))
                .await?
                .next()
                .ok_or_else(|| HealthError::Unhealthy(format!("cannot resolve {}", host)))?;
            let bind = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(peer).await?;
            socket.send(&query).await?;

            let mut buf = [0u8; 512];
            let len = socket.recv(&mut buf).await?;
            verify_dns_response(id, &buf[..len])
        };

        timeout(self.timeout, probe)
            .await
            .map_err(|_| HealthError::Timeout(self.timeout))?
    }

    fn configuration(&self) -> HealthCheckConfig {
        HealthCheckConfig::Dns {
            query: self.query.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

pub struct SyslogChecker {
    timeout: Duration,
}

#[async_trait]
impl HealthChecker for SyslogChecker {
    async fn check(&self, host: &str, port: u16) -> Result<(), HealthError> {
        let probe = async {
            let mut stream = TcpStream::connect(authority(host, port)).await?;
            // RFC 5424, facility user, severity info
            let line = format!(
                "<14>1 {} - brivas-lb - - - health check\n",
                chrono::Utc::now().to_rfc3339()
            );
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            Ok::<(), HealthError>(())
        };

        timeout(self.timeout, probe)
            .await
            .map_err(|_| HealthError::Timeout(self.timeout))?
    }

    fn configuration(&self) -> HealthCheckConfig {
        HealthCheckConfig::Syslog {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_dns_query_encoding() {
        let packet = encode_dns_query(0xbeef, "health.example.").unwrap();
        assert_eq!(&packet[..2], &[0xbe, 0xef]);
        assert_eq!(packet[12], 6);
        assert_eq!(&packet[13..19], b"health");
        assert_eq!(packet[19], 7);
        assert_eq!(&packet[packet.len() - 4..], &[0, 1, 0, 1]);

        assert!(encode_dns_query(1, "bad..name").is_err());
    }

    #[test]
    fn test_dns_response_verification() {
        let mut response = encode_dns_query(7, "a.example").unwrap();
        response[2] |= 0x80;
        assert_ok!(verify_dns_response(7, &response));
        assert_err!(verify_dns_response(8, &response));

        response[3] |= 0x03; // NXDOMAIN
        assert_err!(verify_dns_response(7, &response));
        assert_err!(verify_dns_response(7, &response[..4]));
    }

    #[tokio::test]
    async fn test_tcp_checker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = build_checker(&HealthCheckConfig::Tcp { timeout_ms: 500 }).unwrap();
        assert_ok!(checker.check("127.0.0.1", port).await);

        drop(listener);
        assert_err!(checker.check("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_dummy_checker_always_healthy() {
        let checker = build_checker(&HealthCheckConfig::Dummy).unwrap();
        assert_ok!(checker.check("203.0.113.1", 1).await);
        assert_eq!(checker.configuration(), HealthCheckConfig::Dummy);
    }

    #[test]
    fn test_http_path_validated() {
        let cfg = HealthCheckConfig::Http {
            path: "ping".into(),
            expected_status: 200,
            host: None,
            timeout_ms: 100,
        };
        assert!(build_checker(&cfg).is_err());
    }
}
