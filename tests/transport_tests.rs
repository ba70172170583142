mod common;

use ad_shield::config::CacheConfig;
use ad_shield::error::{ErrorKind, TransportError};
use ad_shield::resolver::{ResolutionOrchestrator, UpstreamSettings};
use ad_shield::stats::{StatsCollector, UpstreamRole};
use ad_shield::transport::dot::{exchange_framed, read_framed};
use ad_shield::transport::{
    DnsTransport, DohExchange, DohTransport, PlainTransport, Protocol,
};
use ad_shield::dns::parse_query;
use common::{answer, query, spawn_upstream};
use hickory_proto::rr::RecordType;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

// --- DoH ---

struct FlakyExchange {
    post_ok: bool,
    get_ok: bool,
    posts: AtomicUsize,
    gets: AtomicUsize,
}

impl FlakyExchange {
    fn new(post_ok: bool, get_ok: bool) -> Self {
        Self {
            post_ok,
            get_ok,
            posts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl DohExchange for FlakyExchange {
    async fn post(&self, _endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if self.post_ok {
            Ok(answer(query, Ipv4Addr::new(10, 0, 0, 1), 60))
        } else {
            Err(TransportError::malformed("HTTP status 415 Unsupported Media Type"))
        }
    }

    async fn get(&self, _endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.get_ok {
            Ok(answer(query, Ipv4Addr::new(10, 0, 0, 2), 60))
        } else {
            Err(TransportError::io("connection reset"))
        }
    }
}

#[tokio::test]
async fn test_doh_falls_back_to_get_once() {
    let doh = DohTransport::with_exchange(FlakyExchange::new(false, true));
    let q = query(0x0101, "example.com.", RecordType::A);

    let response = doh
        .query("https://dns.example/dns-query", &q, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(&response[..2], &q[..2]);

    let doh_failing = DohTransport::with_exchange(FlakyExchange::new(false, false));
    let err = doh_failing
        .query("https://dns.example/dns-query", &q, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoError);
}

#[tokio::test]
async fn test_doh_exchange_counts() {
    let exchange = Arc::new(FlakyExchange::new(false, false));

    struct Shared(Arc<FlakyExchange>);

    #[async_trait::async_trait]
    impl DohExchange for Shared {
        async fn post(&self, endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.0.post(endpoint, query).await
        }
        async fn get(&self, endpoint: &Url, query: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.0.get(endpoint, query).await
        }
    }

    let doh = DohTransport::with_exchange(Shared(exchange.clone()));
    let q = query(7, "example.com.", RecordType::AAAA);
    assert!(doh.query("dns.example", &q, Duration::from_secs(5)).await.is_err());

    assert_eq!(exchange.posts.load(Ordering::SeqCst), 1);
    assert_eq!(exchange.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_doh_rejects_plain_http_endpoint() {
    let doh = DohTransport::with_exchange(FlakyExchange::new(true, true));
    let q = query(1, "example.com.", RecordType::A);
    let err = doh
        .query("http://dns.example/dns-query", &q, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::InvalidUpstream { .. }));
}

// --- DoT framing ---

#[tokio::test]
async fn test_dot_framing_round_trip() {
    let (mut client, mut server) = tokio::io::duplex(8192);
    let q = query(0x2222, "example.com.", RecordType::A);

    let server_task = tokio::spawn(async move {
        let len = server.read_u16().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        server.read_exact(&mut body).await.unwrap();
        let response = answer(&body, Ipv4Addr::new(192, 0, 2, 7), 60);
        server.write_u16(response.len() as u16).await.unwrap();
        server.write_all(&response).await.unwrap();
        body
    });

    let response = exchange_framed(&mut client, &q).await.unwrap();
    assert_eq!(server_task.await.unwrap(), q);
    assert_eq!(&response[..2], &[0x22, 0x22]);
}

#[tokio::test]
async fn test_dot_rejects_bad_length_prefix() {
    let mut zero: &[u8] = &[0x00, 0x00];
    assert!(matches!(
        read_framed(&mut zero).await,
        Err(TransportError::MalformedResponse(_))
    ));

    let mut oversized: &[u8] = &[0x10, 0x01, 0xaa];
    assert!(matches!(
        read_framed(&mut oversized).await,
        Err(TransportError::MalformedResponse(_))
    ));
}

// --- Plain + orchestrator ---

#[tokio::test]
async fn test_plain_transport_loopback() {
    let upstream = spawn_upstream(Some(Ipv4Addr::new(198, 51, 100, 1))).await;
    let q = query(0x3333, "example.com.", RecordType::A);

    let response = PlainTransport
        .query(&upstream.addr.to_string(), &q, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(&response[..2], &[0x33, 0x33]);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

fn settings(primary: String, fallback: Option<String>, attempt_ms: u64, total_ms: u64) -> UpstreamSettings {
    UpstreamSettings {
        protocol: Protocol::Plain,
        primary,
        fallback,
        query_timeout: Duration::from_millis(total_ms),
        attempt_timeout: Duration::from_millis(attempt_ms),
    }
}

fn no_cache() -> CacheConfig {
    CacheConfig {
        enable: false,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn test_orchestrator_uses_fallback_when_primary_silent() {
    let silent = spawn_upstream(None).await;
    let healthy = spawn_upstream(Some(Ipv4Addr::new(203, 0, 113, 9))).await;
    let stats = StatsCollector::new();

    let orchestrator = ResolutionOrchestrator::new(
        settings(silent.addr.to_string(), Some(healthy.addr.to_string()), 200, 2000),
        Arc::new(PlainTransport),
        &no_cache(),
        stats.clone(),
    );

    let raw = query(0x4444, "example.com.", RecordType::A);
    let info = parse_query(&raw).unwrap();
    let resolution = orchestrator.resolve(&info, &raw).await.unwrap();

    assert_eq!(resolution.role, UpstreamRole::Fallback);
    assert_eq!(&*resolution.upstream, healthy.addr.to_string());
    assert_eq!(silent.hits.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.hits.load(Ordering::SeqCst), 1);
    assert!(stats.snapshot().fallback_avg_ms.is_some());
}

#[tokio::test]
async fn test_orchestrator_overall_deadline() {
    let primary = spawn_upstream(None).await;
    let fallback = spawn_upstream(None).await;

    let orchestrator = ResolutionOrchestrator::new(
        settings(primary.addr.to_string(), Some(fallback.addr.to_string()), 300, 400),
        Arc::new(PlainTransport),
        &no_cache(),
        StatsCollector::new(),
    );

    let raw = query(5, "example.com.", RecordType::A);
    let info = parse_query(&raw).unwrap();
    let started = std::time::Instant::now();
    let failure = orchestrator.resolve(&info, &raw).await.unwrap_err();

    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert!(failure.fallback_attempted);
    assert_eq!(failure.upstream, fallback.addr.to_string());
    assert!(started.elapsed() < Duration::from_millis(1500));
}
