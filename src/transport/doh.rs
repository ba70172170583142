//! DNS over HTTPS (RFC 8484).
//!
//! POST carries the raw query as the body; GET carries it base64url-encoded
//! (no padding) in the `dns` parameter. A query tries POST first and falls
//! back to a single GET on any POST failure, inside one time budget.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use super::{DnsTransport, MAX_DATAGRAM_LEN};
use crate::error::TransportError;

pub const DNS_MESSAGE: &str = "application/dns-message";
const DEFAULT_PATH: &str = "/dns-query";

/// The two HTTP request shapes, split out so the fallback policy can be
/// exercised without a network.
#[async_trait::async_trait]
pub trait DohExchange: Send + Sync {
    async fn post(&self, endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError>;
    async fn get(&self, endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError>;
}

pub struct ReqwestExchange {
    client: Client,
}

impl ReqwestExchange {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("AdShield/", env!("CARGO_PKG_VERSION")))
            .use_rustls_tls()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(TransportError::io)?;
        Ok(Self { client })
    }

    async fn read_response(resp: Response) -> Result<Vec<u8>, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::malformed(format!("HTTP status {}", status)));
        }
        let body = resp.bytes().await.map_err(TransportError::io)?;
        if body.is_empty() || body.len() > MAX_DATAGRAM_LEN {
            return Err(TransportError::malformed(format!(
                "response body of {} bytes",
                body.len()
            )));
        }
        Ok(body.to_vec())
    }
}

#[async_trait::async_trait]
impl DohExchange for ReqwestExchange {
    async fn post(&self, endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        let resp = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(query.to_vec())
            .send()
            .await
            .map_err(TransportError::io)?;
        Self::read_response(resp).await
    }

    async fn get(&self, endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        let resp = self
            .client
            .get(get_url(endpoint, query))
            .header(ACCEPT, DNS_MESSAGE)
            .send()
            .await
            .map_err(TransportError::io)?;
        Self::read_response(resp).await
    }
}

pub struct DohTransport<E = ReqwestExchange> {
    exchange: E,
}

impl DohTransport<ReqwestExchange> {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            exchange: ReqwestExchange::new()?,
        })
    }
}

impl<E: DohExchange> DohTransport<E> {
    pub fn with_exchange(exchange: E) -> Self {
        Self { exchange }
    }
}

#[async_trait::async_trait]
impl<E: DohExchange> DnsTransport for DohTransport<E> {
    async fn query(
        &self,
        upstream: &str,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let endpoint = endpoint_url(upstream)?;
        let deadline = Instant::now() + timeout;

        // POST gets half the budget so a stalled POST still leaves room for GET.
        let post = tokio::time::timeout(timeout / 2, self.exchange.post(&endpoint, query))
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout / 2)));

        match post {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!("DoH POST to {} failed ({}), retrying with GET", endpoint, e);
                tokio::time::timeout_at(deadline, self.exchange.get(&endpoint, query))
                    .await
                    .map_err(|_| TransportError::Timeout(timeout))?
            }
        }
    }
}

/// Accepts a full `https://` URL or a bare host (`dns.google`), which gets
/// the conventional `/dns-query` path.
pub fn endpoint_url(upstream: &str) -> Result<Url, TransportError> {
    let raw = upstream.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}{}", raw, DEFAULT_PATH)
    };
    let url = Url::parse(&candidate)
        .map_err(|e| TransportError::invalid_upstream(upstream, e.to_string()))?;
    if url.scheme() != "https" {
        return Err(TransportError::invalid_upstream(
            upstream,
            "DoH requires an https:// endpoint",
        ));
    }
    if url.host_str().is_none() {
        return Err(TransportError::invalid_upstream(upstream, "missing host"));
    }
    Ok(url)
}

pub fn get_url(endpoint: &Url, query: &[u8]) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("dns", &URL_SAFE_NO_PAD.encode(query));
    url
}
