use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use hickory_proto::rr::Name;
use tracing::{debug, info, warn};

use super::types::{LogContext, QueryContext};
use crate::apps::{AppResolver, ProcNetAppResolver};
use crate::config::{BlockingConfig, Config, FirewallConfig, UpstreamConfig};
use crate::dns::{self, QueryInfo};
use crate::engine::{FilterRepository, HttpListFetcher, ListFetcher};
use crate::error::{FilterError, TransportError};
use crate::logger::{DnsErrorEntry, DnsLogEntry, LogAction, QueryLogger};
use crate::policy::{
    BlockReason, FirewallPolicy, NetworkType, PolicyEngine, ProfileChange, ProfileManager,
    RewriteMap, Verdict,
};
use crate::resolver::{ResolutionFailure, ResolutionOrchestrator, UpstreamSettings};
use crate::rules::{CustomRuleSet, Whitelist};
use crate::stats::StatsCollector;
use crate::transport::{build_transport, DnsTransport};

/// Collaborators the engine talks to.
pub struct EngineDeps {
    pub fetcher: Arc<dyn ListFetcher>,
    pub transport: Arc<dyn DnsTransport>,
    pub apps: Arc<dyn AppResolver>,
    pub logger: Arc<QueryLogger>,
    pub stats: Arc<StatsCollector>,
}

/// The capture-layer boundary: raw query bytes in, raw response bytes (or
/// nothing) out.
///
/// Safe to call from many tasks at once. Configuration setters replace
/// snapshots atomically; queries already being evaluated finish on the
/// snapshot they loaded.
pub struct DnsEngine {
    blocking: BlockingConfig,
    default_filter_urls: Vec<String>,
    /// Enabled sources from before the current profile took over.
    pre_profile_urls: Mutex<Option<Vec<String>>>,
    policy: PolicyEngine,
    filters: Arc<FilterRepository>,
    resolver: ResolutionOrchestrator,
    profiles: ProfileManager,
    apps: Arc<dyn AppResolver>,
    logger: Arc<QueryLogger>,
    stats: Arc<StatsCollector>,
}

impl DnsEngine {
    pub fn new(config: &Config, deps: EngineDeps) -> Self {
        let filters = Arc::new(FilterRepository::new(
            deps.fetcher,
            config.filters.false_positive_rate,
            config.filters.concurrent_downloads,
        ));
        filters.seed(&config.filters.sources);

        let policy = PolicyEngine::new(filters.index_handle());
        policy.set_rules(CustomRuleSet::from_lines(
            config.custom_rules.iter().map(String::as_str),
        ));
        policy.set_whitelist(Whitelist::new(&config.whitelist));
        policy.set_firewall(FirewallPolicy::from_config(&config.firewall));
        policy.set_network(config.firewall.network);

        let resolver = ResolutionOrchestrator::new(
            UpstreamSettings::from_config(&config.upstream),
            deps.transport,
            &config.cache,
            deps.stats.clone(),
        );

        Self {
            blocking: config.blocking.clone(),
            default_filter_urls: config
                .filters
                .sources
                .iter()
                .filter(|s| s.enabled)
                .map(|s| s.url.clone())
                .collect(),
            pre_profile_urls: Mutex::new(None),
            policy,
            filters,
            resolver,
            profiles: ProfileManager::from_config(
                &config.profiles,
                &config.schedules,
                config.active_profile,
            ),
            apps: deps.apps,
            logger: deps.logger,
            stats: deps.stats,
        }
    }

    /// Production wiring: HTTP list downloads, the configured transport and
    /// `/proc` based app attribution. Must run inside a tokio runtime.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let fetcher = Arc::new(HttpListFetcher::new()?);
        let transport =
            build_transport(config.upstream.protocol).context("Failed to build upstream transport")?;
        let apps = ProcNetAppResolver::new(&config.apps);
        apps.reload_packages().await;

        Ok(Self::new(
            config,
            EngineDeps {
                fetcher,
                transport,
                apps: Arc::new(apps),
                logger: QueryLogger::new(&config.logging),
                stats: StatsCollector::new(),
            },
        ))
    }

    /// Answer one intercepted query. `None` means no response at all: the
    /// packet was not a query, the app is firewalled, or resolution failed.
    pub async fn handle_query(&self, source_port: u16, bytes: &[u8]) -> Option<Vec<u8>> {
        let start = Instant::now();
        let Some(query) = dns::parse_query(bytes) else {
            debug!("Ignoring non-query packet from port {}", source_port);
            return None;
        };
        self.stats.inc_queries();

        let package = self.apps.package_for_port(source_port).await;
        let ctx = QueryContext {
            name: query.name.clone(),
            qtype: query.qtype,
            app_name: package
                .as_deref()
                .map(|p| self.apps.display_name(p))
                .unwrap_or_default(),
            start,
        };

        let now = Local::now().naive_local();
        match self.policy.evaluate(&query.name, package.as_deref(), &now) {
            Verdict::Drop => {
                self.stats.inc_firewall_dropped();
                self.log(
                    &ctx,
                    LogContext {
                        action: LogAction::FirewallDropped,
                        reason: None,
                        upstream: None,
                    },
                );
                None
            }
            Verdict::Block(reason) => self.serve_blocked(&query, &ctx, reason),
            Verdict::Rewrite(target) => self.serve_rewrite(&query, &ctx, &target).await,
            Verdict::Allow(_) => self.resolve_and_serve(&query, bytes, &ctx).await,
        }
    }

    /// Best-effort app label for a source port; empty when unknown.
    pub async fn resolve_app_name(&self, source_port: u16) -> String {
        self.apps.resolve_app_name(source_port).await
    }

    /// Policy outcome for `domain` ignoring the firewall.
    pub fn is_blocked(&self, domain: &str) -> bool {
        self.policy.is_blocked(domain)
    }

    fn serve_blocked(
        &self,
        query: &QueryInfo,
        ctx: &QueryContext,
        reason: BlockReason,
    ) -> Option<Vec<u8>> {
        match reason {
            BlockReason::CustomRule => self.stats.inc_blocked_by_rule(),
            BlockReason::FilterList => self.stats.inc_blocked_by_list(),
        }
        self.log(
            ctx,
            LogContext {
                action: LogAction::Blocked,
                reason: Some(reason),
                upstream: None,
            },
        );

        match dns::block_response(&query.message, self.blocking.response, self.blocking.ttl) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("Failed to build block response for {}: {}", ctx.name, e);
                None
            }
        }
    }

    async fn serve_rewrite(
        &self,
        query: &QueryInfo,
        ctx: &QueryContext,
        target: &Name,
    ) -> Option<Vec<u8>> {
        let target_bytes = match dns::build_query(query.id, target, query.qtype) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to build query for rewrite target {}: {}", target, e);
                return None;
            }
        };
        let target_query = dns::parse_query(&target_bytes)?;

        let resolution = match self.resolver.resolve(&target_query, &target_bytes).await {
            Ok(resolution) => resolution,
            Err(failure) => {
                self.record_failure(ctx, failure);
                return None;
            }
        };

        let ttl = dns::min_ttl(&resolution.response).unwrap_or(self.blocking.ttl);
        match dns::cname_response(&query.message, target, &resolution.response, ttl) {
            Ok(response) => {
                self.stats.inc_rewritten();
                self.log(
                    ctx,
                    LogContext {
                        action: LogAction::Rewritten,
                        reason: None,
                        upstream: Some(resolution.upstream),
                    },
                );
                Some(response)
            }
            Err(e) => {
                warn!("Rewrite of {} to {} failed: {}", ctx.name, target, e);
                None
            }
        }
    }

    async fn resolve_and_serve(
        &self,
        query: &QueryInfo,
        raw: &[u8],
        ctx: &QueryContext,
    ) -> Option<Vec<u8>> {
        match self.resolver.resolve(query, raw).await {
            Ok(resolution) => {
                let action = if resolution.from_cache {
                    self.stats.inc_cache_hit();
                    LogAction::Cached
                } else {
                    self.stats.inc_forwarded();
                    LogAction::Forwarded
                };
                self.log(
                    ctx,
                    LogContext {
                        action,
                        reason: None,
                        upstream: Some(resolution.upstream),
                    },
                );
                Some(resolution.response)
            }
            Err(failure) => {
                self.record_failure(ctx, failure);
                None
            }
        }
    }

    fn log(&self, ctx: &QueryContext, log: LogContext) {
        self.logger.log(DnsLogEntry {
            domain: ctx.name.to_string(),
            timestamp: Local::now(),
            query_type: ctx.qtype,
            action: log.action,
            reason: log.reason,
            blocked: matches!(log.action, LogAction::Blocked | LogAction::FirewallDropped),
            response_time_ms: ctx.start.elapsed().as_millis() as u64,
            app_name: ctx.app_name.clone(),
            upstream: log.upstream.map(|u| u.to_string()),
        });
    }

    fn record_failure(&self, ctx: &QueryContext, failure: ResolutionFailure) {
        self.stats.inc_failure();
        self.logger.log_error(DnsErrorEntry {
            domain: ctx.name.to_string(),
            timestamp: Local::now(),
            query_type: ctx.qtype,
            kind: failure.kind,
            message: failure.error.to_string(),
            upstream: failure.upstream,
            fallback_attempted: failure.fallback_attempted,
            app_name: ctx.app_name.clone(),
        });
    }

    pub fn set_custom_rules(&self, rules: &[String]) {
        self.policy
            .set_rules(CustomRuleSet::from_lines(rules.iter().map(String::as_str)));
    }

    pub fn set_whitelist(&self, domains: &[String]) {
        self.policy.set_whitelist(Whitelist::new(domains));
    }

    pub fn set_firewall(&self, cfg: &FirewallConfig) {
        self.policy.set_firewall(FirewallPolicy::from_config(cfg));
        self.policy.set_network(cfg.network);
    }

    /// Called by the host when connectivity changes.
    pub fn set_network(&self, network: NetworkType) {
        self.policy.set_network(network);
    }

    /// Switch protocol or upstream addresses. Cached answers are dropped.
    pub fn set_upstream(&self, cfg: &UpstreamConfig) -> Result<(), TransportError> {
        let transport = build_transport(cfg.protocol)?;
        self.set_upstream_with(UpstreamSettings::from_config(cfg), transport);
        Ok(())
    }

    pub fn set_upstream_with(&self, settings: UpstreamSettings, transport: Arc<dyn DnsTransport>) {
        info!(
            "Upstream changed to {} {} (fallback {:?})",
            settings.protocol, settings.primary, settings.fallback
        );
        self.resolver.reconfigure(settings, transport);
        self.resolver.clear_cache();
    }

    /// Choose a profile by hand; `None` clears the choice. Takes effect on
    /// the next [`profile_tick`](Self::profile_tick).
    pub fn select_profile(&self, id: Option<u32>) -> bool {
        self.profiles.set_manual(id)
    }

    /// Re-evaluate profile schedules at `at` and apply a change of active
    /// profile: its filter sources become the enabled set and its search
    /// restrictions become the rewrite map.
    pub async fn profile_tick(&self, at: &NaiveDateTime) -> Result<Option<ProfileChange>, FilterError> {
        let Some(change) = self.profiles.tick(at) else {
            return Ok(None);
        };

        match &change {
            ProfileChange::Activated(profile) => {
                // Switching between profiles keeps the first snapshot.
                self.pre_profile_urls
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert_with(|| self.filters.enabled_urls());
                self.policy.set_rewrites(RewriteMap::new(
                    profile.safe_search,
                    profile.youtube_restricted,
                ));
                self.filters
                    .apply_enabled_urls(&profile.enabled_filter_urls)
                    .await?;
            }
            ProfileChange::Deactivated => {
                self.policy.set_rewrites(RewriteMap::default());
                let restored = self
                    .pre_profile_urls
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_else(|| self.default_filter_urls.clone());
                self.filters.apply_enabled_urls(&restored).await?;
            }
        }
        Ok(Some(change))
    }

    pub fn filters(&self) -> &Arc<FilterRepository> {
        &self.filters
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn resolver(&self) -> &ResolutionOrchestrator {
        &self.resolver
    }

    pub fn profiles(&self) -> &ProfileManager {
        &self.profiles
    }

    pub fn logger(&self) -> &Arc<QueryLogger> {
        &self.logger
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }
}
