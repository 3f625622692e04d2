//! Server discovery through DNS

use super::client::SrvRecord;
use super::message::SipError;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::net::SocketAddr;
use tracing::debug;

#[async_trait]
pub trait Resolver: Send + Sync {
    /// SRV records of `name`, best first
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SipError>;

    /// First address of `host`
    async fn lookup_host(&self, host: &str, port: u16) -> Result<SocketAddr, SipError>;
}

/// Resolver using the system DNS configuration
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Result<Self, SipError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| SipError::DnsError(format!("Failed to read system DNS config: {}", e)))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SipError> {
        let lookup = self
            .inner
            .srv_lookup(name)
            .await
            .map_err(|e| SipError::DnsError(format!("SRV lookup of {} failed: {}", name, e)))?;

        let mut records: Vec<_> = lookup
            .iter()
            .map(|srv| (srv.priority(), srv.weight(), srv.target().to_utf8(), srv.port()))
            .collect();
        // lower priority first, then higher weight
        records.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let records: Vec<SrvRecord> = records
            .into_iter()
            .map(|(_, _, target, port)| SrvRecord {
                target: target.trim_end_matches('.').to_string(),
                port,
            })
            .collect();
        debug!("SRV {} -> {:?}", name, records);
        Ok(records)
    }

    async fn lookup_host(&self, host: &str, port: u16) -> Result<SocketAddr, SipError> {
        if let Ok(ip) = host.parse() {
            return Ok(SocketAddr::new(ip, port));
        }
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| SipError::DnsError(format!("Lookup of {} failed: {}", host, e)))?;
        lookup
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| SipError::DnsError(format!("No address for {}", host)))
    }
}
