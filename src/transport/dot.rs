use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{check_transaction_id, resolve_addr, split_host_port, DnsTransport, MAX_MESSAGE_LEN};
use crate::error::TransportError;

const DEFAULT_PORT: u16 = 853;

/// DNS over TLS (RFC 7858), one connection per query.
pub struct DotTransport {
    connector: TlsConnector,
}

impl DotTransport {
    pub fn new() -> Result<Self, TransportError> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(TransportError::io)?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    async fn exchange(&self, upstream: &str, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        let (host, port) = split_host_port(upstream, DEFAULT_PORT)?;
        let name = server_name(&host)?;
        let addr = resolve_addr(&host, port).await?;

        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true).ok();
        let mut tls = self.connector.connect(name, tcp).await?;

        let result = exchange_framed(&mut tls, query).await;
        if let Err(e) = tls.shutdown().await {
            debug!("DoT shutdown for {} failed: {}", upstream, e);
        }
        result
    }
}

#[async_trait::async_trait]
impl DnsTransport for DotTransport {
    async fn query(
        &self,
        upstream: &str,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        // On timeout the dropped future closes the socket.
        tokio::time::timeout(timeout, self.exchange(upstream, query))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }
}

/// IP literals become `ServerName::IpAddress`, for which no SNI extension is
/// sent; anything else must be a valid DNS name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::from(ip));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::invalid_upstream(host, "not a valid TLS server name"))
}

/// Write one length-prefixed query and read back one length-prefixed response.
pub async fn exchange_framed<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len())
        .map_err(|_| TransportError::malformed("query exceeds 65535 bytes"))?;
    let mut frame = Vec::with_capacity(2 + query.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(query);

    stream.write_all(&frame).await?;
    stream.flush().await?;

    let response = read_framed(stream).await?;
    check_transaction_id(query, &response)?;
    Ok(response)
}

/// Read a 2-byte big-endian length then exactly that many bytes. A length of
/// zero or above [`MAX_MESSAGE_LEN`] is rejected before any body read.
pub async fn read_framed<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(TransportError::malformed(format!(
            "declared response length {}",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_length_guard_rejects_zero_and_oversized() {
        let mut zero: &[u8] = &[0x00, 0x00, 0xaa, 0xbb];
        assert!(matches!(
            read_framed(&mut zero).await,
            Err(TransportError::MalformedResponse(_))
        ));
        // The body bytes were left unread.
        assert_eq!(zero, &[0xaa, 0xbb]);

        // 4097 declared with no body: rejected as malformed, not as a short read.
        let mut oversized: &[u8] = &[0x10, 0x01];
        assert!(matches!(
            read_framed(&mut oversized).await,
            Err(TransportError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_read_framed_exact_body() {
        let mut data: &[u8] = &[0x00, 0x03, 1, 2, 3, 99];
        assert_eq!(read_framed(&mut data).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(data, &[99]);

        let mut max: Vec<u8> = vec![0x10, 0x00];
        max.extend(std::iter::repeat(7).take(4096));
        assert_eq!(read_framed(&mut max.as_slice()).await.unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let mut data: &[u8] = &[0x00, 0x05, 1, 2];
        assert!(matches!(
            read_framed(&mut data).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_framed_exchange_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let request = read_framed(&mut server).await.unwrap();
            let mut reply = request.clone();
            reply.push(0xee);
            let mut frame = (reply.len() as u16).to_be_bytes().to_vec();
            frame.extend_from_slice(&reply);
            server.write_all(&frame).await.unwrap();
        });

        let response = exchange_framed(&mut client, &[0xab, 0xcd, 1])
            .await
            .unwrap();
        assert_eq!(response, vec![0xab, 0xcd, 1, 0xee]);
    }

    #[test]
    fn test_ip_literals_skip_sni() {
        assert!(matches!(
            server_name("1.1.1.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("2606:4700::1111").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("dns.google").unwrap(),
            ServerName::DnsName(_)
        ));
    }
}
