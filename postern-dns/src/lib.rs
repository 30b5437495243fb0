//! Minimal UDP resolver for the mail path.
//!
//! One question per query, recursion requested from a configured upstream
//! (default 8.8.8.8). SPF, DKIM and DMARC evaluation go through the
//! [`Lookup`] trait so tests can serve a fixed record set.

pub mod wire;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::UdpSocket;

use wire::{RData, ResponseCode, TYPE_A, TYPE_AAAA, TYPE_MX, TYPE_TXT};

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("query for {0} timed out")]
    Timeout(String),

    #[error("dns I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Wire(#[from] wire::WireError),

    #[error("domain does not exist: {0}")]
    NxDomain(String),

    #[error("server failure ({rcode:?}) for {name}")]
    ServerFailure { name: String, rcode: ResponseCode },
}

impl DnsError {
    /// Whether a retry later could succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Io(_) | Self::ServerFailure { .. }
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Upstream recursive resolver, `host:port`.
    #[serde(default = "default_server")]
    pub server: String,

    /// Per-attempt receive timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_server() -> String {
    "8.8.8.8:53".to_string()
}

const fn default_timeout_secs() -> u64 {
    2
}

const fn default_attempts() -> u32 {
    2
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

/// Record lookups the authenticity pipeline and relay depend on.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError>;
    async fn mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError>;
}

/// Stateless request/response client; safe to share across tasks.
#[derive(Debug)]
pub struct Resolver {
    config: DnsConfig,
}

impl Resolver {
    #[must_use]
    pub fn new(config: DnsConfig) -> Self {
        Self { config }
    }

    async fn query(&self, name: &str, rtype: u16) -> Result<Vec<wire::Answer>, DnsError> {
        let mut last_timeout = None;

        for attempt in 0..self.config.attempts.max(1) {
            let id: u16 = rand::rng().random();
            let packet = wire::build_query(id, name, rtype)?;

            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&self.config.server).await?;
            socket.send(&packet).await?;

            let mut buf = [0u8; 4096];
            let received = tokio::time::timeout(
                Duration::from_secs(self.config.timeout_secs),
                socket.recv(&mut buf),
            )
            .await;

            let len = match received {
                Ok(read) => read?,
                Err(_) => {
                    tracing::debug!(name, rtype, attempt, "dns attempt timed out");
                    last_timeout = Some(DnsError::Timeout(name.to_string()));
                    continue;
                }
            };

            let response = wire::parse_response(&buf[..len])?;
            if response.id != id {
                tracing::debug!(name, "dns response id mismatch, discarding");
                last_timeout = Some(DnsError::Timeout(name.to_string()));
                continue;
            }

            return match response.rcode {
                ResponseCode::NoError => Ok(response.answers),
                ResponseCode::NxDomain => Err(DnsError::NxDomain(name.to_string())),
                rcode => Err(DnsError::ServerFailure {
                    name: name.to_string(),
                    rcode,
                }),
            };
        }

        Err(last_timeout.unwrap_or_else(|| DnsError::Timeout(name.to_string())))
    }

    /// NXDOMAIN degrades to "no records", which is what every caller wants.
    async fn query_lenient(&self, name: &str, rtype: u16) -> Result<Vec<wire::Answer>, DnsError> {
        match self.query(name, rtype).await {
            Err(DnsError::NxDomain(_)) => Ok(Vec::new()),
            other => other,
        }
    }
}

#[async_trait]
impl Lookup for Resolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        Ok(self
            .query_lenient(name, TYPE_TXT)
            .await?
            .into_iter()
            .filter_map(|answer| match answer.data {
                RData::Txt(text) => Some(text),
                _ => None,
            })
            .collect())
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        Ok(self
            .query_lenient(name, TYPE_A)
            .await?
            .into_iter()
            .filter_map(|answer| match answer.data {
                RData::A(ip) => Some(ip),
                _ => None,
            })
            .collect())
    }

    async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        Ok(self
            .query_lenient(name, TYPE_AAAA)
            .await?
            .into_iter()
            .filter_map(|answer| match answer.data {
                RData::Aaaa(ip) => Some(ip),
                _ => None,
            })
            .collect())
    }

    async fn mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        let mut records: Vec<MxRecord> = self
            .query_lenient(name, TYPE_MX)
            .await?
            .into_iter()
            .filter_map(|answer| match answer.data {
                RData::Mx {
                    preference,
                    exchange,
                } => Some(MxRecord {
                    preference,
                    exchange,
                }),
                _ => None,
            })
            .collect();

        records.sort_by_key(|record| record.preference);
        Ok(records)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = DnsConfig::default();
        assert_eq!(config.server, "8.8.8.8:53");
        assert_eq!(config.timeout_secs, 2);
        assert_eq!(config.attempts, 2);
    }

    #[test]
    fn temporary_classification() {
        assert!(DnsError::Timeout("x".to_string()).is_temporary());
        assert!(!DnsError::NxDomain("x".to_string()).is_temporary());
    }

    #[tokio::test]
    async fn resolves_against_local_stub_server() {
        // A one-shot DNS server answering any question with a fixed A record.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = wire::parse_response(&buf[..len]).unwrap();

            let mut reply = vec![
                (request.id >> 8) as u8,
                (request.id & 0xFF) as u8,
                0x81,
                0x80,
                0x00,
                0x00,
                0x00,
                0x01,
                0x00,
                0x00,
                0x00,
                0x00,
            ];
            reply.extend_from_slice(&[4, b'h', b'o', b's', b't', 0]);
            reply.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 127, 0, 0, 7]);
            server.send_to(&reply, peer).await.unwrap();
        });

        let resolver = Resolver::new(DnsConfig {
            server: addr.to_string(),
            timeout_secs: 2,
            attempts: 1,
        });

        let ips = resolver.a("host").await.unwrap();
        assert_eq!(ips, vec!["127.0.0.7".parse::<Ipv4Addr>().unwrap()]);
        handle.await.unwrap();
    }
}
