use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use super::{check_transaction_id, resolve_addr, split_host_port, DnsTransport, MAX_DATAGRAM_LEN};
use crate::error::TransportError;

const DEFAULT_PORT: u16 = 53;

/// Classic DNS over UDP: one datagram out, one datagram back.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTransport;

impl PlainTransport {
    async fn exchange(&self, upstream: &str, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        let (host, port) = split_host_port(upstream, DEFAULT_PORT)?;
        let addr = resolve_addr(&host, port).await?;

        let bind: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let len = socket.recv(&mut buf).await?;
        buf.truncate(len);

        check_transaction_id(query, &buf)?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl DnsTransport for PlainTransport {
    async fn query(
        &self,
        upstream: &str,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        tokio::time::timeout(timeout, self.exchange(upstream, query))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }
}
