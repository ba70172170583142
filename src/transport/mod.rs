//! Upstream DNS transports.
//!
//! Each transport performs one raw query/response exchange and reports
//! failure as a [`TransportError`] value. Fallback between upstreams lives in
//! the resolver, not here.

pub mod doh;
pub mod dot;
pub mod plain;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub use doh::{DohExchange, DohTransport, ReqwestExchange};
pub use dot::DotTransport;
pub use plain::PlainTransport;

/// Ceiling on a DoT length prefix.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Largest DNS message a datagram or HTTP body can carry.
pub const MAX_DATAGRAM_LEN: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Plain,
    Doh,
    Dot,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Doh => "doh",
            Self::Dot => "dot",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single query/response exchange with one upstream.
#[async_trait::async_trait]
pub trait DnsTransport: Send + Sync {
    async fn query(
        &self,
        upstream: &str,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

pub fn build_transport(protocol: Protocol) -> Result<Arc<dyn DnsTransport>, TransportError> {
    Ok(match protocol {
        Protocol::Plain => Arc::new(PlainTransport),
        Protocol::Doh => Arc::new(DohTransport::new()?),
        Protocol::Dot => Arc::new(DotTransport::new()?),
    })
}

/// Split `host`, `host:port`, `ip`, `ip:port` or `[v6]:port`.
pub(crate) fn split_host_port(
    upstream: &str,
    default_port: u16,
) -> Result<(String, u16), TransportError> {
    let s = upstream.trim();
    if s.is_empty() {
        return Err(TransportError::invalid_upstream(upstream, "empty address"));
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok((ip.to_string(), default_port));
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return Ok((inner.to_string(), default_port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::invalid_upstream(upstream, "invalid port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((s.to_string(), default_port)),
    }
}

pub(crate) async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TransportError::invalid_upstream(host, "no addresses found"))
}

pub(crate) fn check_transaction_id(query: &[u8], response: &[u8]) -> Result<(), TransportError> {
    if query.len() < 2 || response.len() < 2 || query[..2] != response[..2] {
        return Err(TransportError::malformed("transaction id mismatch"));
    }
    Ok(())
}
