use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use moka::future::Cache;
use moka::Expiry;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{CacheConfig, UpstreamConfig};
use crate::dns::{self, QueryInfo};
use crate::error::{ErrorKind, TransportError};
use crate::stats::{StatsCollector, UpstreamRole};
use crate::transport::{DnsTransport, Protocol};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub protocol: Protocol,
    pub primary: String,
    pub fallback: Option<String>,
    /// Deadline for the whole attempt sequence.
    pub query_timeout: Duration,
    pub attempt_timeout: Duration,
}

impl UpstreamSettings {
    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        Self {
            protocol: cfg.protocol,
            primary: cfg.primary.clone(),
            fallback: cfg.fallback.clone().filter(|f| !f.trim().is_empty()),
            query_timeout: Duration::from_millis(cfg.query_timeout_ms),
            attempt_timeout: Duration::from_millis(cfg.attempt_timeout_ms),
        }
    }
}

struct ActiveUpstreams {
    settings: UpstreamSettings,
    transport: Arc<dyn DnsTransport>,
}

/// A successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Response bytes carrying the caller's transaction id.
    pub response: Vec<u8>,
    pub upstream: Arc<str>,
    pub role: UpstreamRole,
    pub from_cache: bool,
}

/// Terminal failure after primary and, if configured, fallback.
#[derive(Debug, Clone, Error)]
#[error("resolution via {upstream} failed ({}): {error}", kind.as_str())]
pub struct ResolutionFailure {
    pub kind: ErrorKind,
    /// The last upstream tried.
    pub upstream: String,
    pub fallback_attempted: bool,
    pub error: TransportError,
}

type CacheKey = (Arc<str>, RecordType);

#[derive(Clone)]
struct CachedResponse {
    bytes: Arc<[u8]>,
    upstream: Arc<str>,
    role: UpstreamRole,
    ttl: Duration,
    stored_at: Instant,
}

struct ResponseExpiry;

impl Expiry<CacheKey, CachedResponse> for ResponseExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CachedResponse,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Sends allowed queries upstream: primary first, then fallback, each
/// attempt bounded by `attempt_timeout` and the whole sequence by
/// `query_timeout`.
///
/// With caching enabled, identical `(name, type)` queries in flight at the
/// same time share one upstream exchange.
pub struct ResolutionOrchestrator {
    active: ArcSwap<ActiveUpstreams>,
    cache: Option<Cache<CacheKey, CachedResponse>>,
    min_ttl: u32,
    max_ttl: u32,
    stats: Arc<StatsCollector>,
}

impl ResolutionOrchestrator {
    pub fn new(
        settings: UpstreamSettings,
        transport: Arc<dyn DnsTransport>,
        cache_cfg: &CacheConfig,
        stats: Arc<StatsCollector>,
    ) -> Self {
        let cache = cache_cfg.enable.then(|| {
            Cache::builder()
                .max_capacity(cache_cfg.capacity)
                .expire_after(ResponseExpiry)
                .build()
        });
        Self {
            active: ArcSwap::from_pointee(ActiveUpstreams {
                settings,
                transport,
            }),
            cache,
            min_ttl: cache_cfg.min_ttl,
            max_ttl: cache_cfg.max_ttl.max(cache_cfg.min_ttl),
            stats,
        }
    }

    /// Swap upstream addresses and transport. In-flight queries finish on
    /// the configuration they started with.
    pub fn reconfigure(&self, settings: UpstreamSettings, transport: Arc<dyn DnsTransport>) {
        debug!(
            "Upstreams now {} primary={} fallback={:?}",
            settings.protocol, settings.primary, settings.fallback
        );
        self.active.store(Arc::new(ActiveUpstreams {
            settings,
            transport,
        }));
    }

    pub fn settings(&self) -> UpstreamSettings {
        self.active.load().settings.clone()
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    pub async fn resolve(&self, query: &QueryInfo, raw: &[u8]) -> Result<Resolution, ResolutionFailure> {
        let Some(cache) = &self.cache else {
            let (bytes, upstream, role) = self.resolve_uncached(raw).await?;
            return Ok(Resolution {
                response: bytes,
                upstream,
                role,
                from_cache: false,
            });
        };

        let key = (query.name.clone(), query.qtype);
        let entry = cache
            .entry(key)
            .or_try_insert_with(self.fetch_cacheable(raw))
            .await
            .map_err(|e| (*e).clone())?;

        let from_cache = !entry.is_fresh();
        let cached = entry.into_value();
        let response = if from_cache {
            let elapsed = cached.stored_at.elapsed().as_secs().min(u32::MAX as u64) as u32;
            dns::age_cached(&cached.bytes, query.id, elapsed)
        } else {
            cached.bytes.to_vec()
        };

        Ok(Resolution {
            response,
            upstream: cached.upstream,
            role: cached.role,
            from_cache,
        })
    }

    async fn fetch_cacheable(&self, raw: &[u8]) -> Result<CachedResponse, ResolutionFailure> {
        let (bytes, upstream, role) = self.resolve_uncached(raw).await?;
        let ttl = self.cache_ttl(&bytes);
        Ok(CachedResponse {
            bytes: bytes.into(),
            upstream,
            role,
            ttl,
            stored_at: Instant::now(),
        })
    }

    /// Min TTL clamped to `[min_ttl, max_ttl]`; zero for answers that must
    /// not be reused.
    fn cache_ttl(&self, response: &[u8]) -> Duration {
        match dns::response_code(response) {
            Some(ResponseCode::NoError) | Some(ResponseCode::NXDomain) => {
                let ttl = dns::min_ttl(response)
                    .unwrap_or(self.min_ttl)
                    .clamp(self.min_ttl, self.max_ttl);
                Duration::from_secs(ttl as u64)
            }
            _ => Duration::ZERO,
        }
    }

    async fn resolve_uncached(
        &self,
        raw: &[u8],
    ) -> Result<(Vec<u8>, Arc<str>, UpstreamRole), ResolutionFailure> {
        let active = self.active.load_full();
        let settings = &active.settings;
        let deadline = Instant::now() + settings.query_timeout;

        let primary_err = match self
            .attempt(&active, &settings.primary, raw, deadline, UpstreamRole::Primary)
            .await
        {
            Ok(bytes) => return Ok((bytes, settings.primary.as_str().into(), UpstreamRole::Primary)),
            Err(e) => e,
        };

        let Some(fallback) = settings.fallback.as_deref() else {
            return Err(ResolutionFailure {
                kind: primary_err.kind(),
                upstream: settings.primary.clone(),
                fallback_attempted: false,
                error: primary_err,
            });
        };

        if Instant::now() >= deadline {
            return Err(ResolutionFailure {
                kind: ErrorKind::Timeout,
                upstream: settings.primary.clone(),
                fallback_attempted: false,
                error: TransportError::Timeout(settings.query_timeout),
            });
        }

        warn!(
            "Primary upstream {} failed ({}), trying fallback {}",
            settings.primary, primary_err, fallback
        );
        match self
            .attempt(&active, fallback, raw, deadline, UpstreamRole::Fallback)
            .await
        {
            Ok(bytes) => Ok((bytes, fallback.into(), UpstreamRole::Fallback)),
            Err(error) => Err(ResolutionFailure {
                kind: error.kind(),
                upstream: fallback.to_string(),
                fallback_attempted: true,
                error,
            }),
        }
    }

    async fn attempt(
        &self,
        active: &ActiveUpstreams,
        upstream: &str,
        raw: &[u8],
        deadline: Instant,
        role: UpstreamRole,
    ) -> Result<Vec<u8>, TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = active.settings.attempt_timeout.min(remaining);
        let start = Instant::now();

        let result = tokio::time::timeout(budget, active.transport.query(upstream, raw, budget))
            .await
            .unwrap_or(Err(TransportError::Timeout(budget)));

        if result.is_ok() {
            self.stats
                .record_upstream_latency(role, start.elapsed().as_millis() as u64);
        }
        result
    }
}
