use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::dns::BlockResponse;
use crate::engine::FilterCategory;
use crate::policy::{ClockTime, NetworkType};
use crate::transport::Protocol;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address of the stand-in capture socket run by the binary.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub filters: FiltersConfig,

    /// Custom rules in rule syntax, one per entry.
    #[serde(default)]
    pub custom_rules: Vec<String>,

    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,

    #[serde(default)]
    pub active_profile: Option<u32>,

    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub blocking: BlockingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub apps: AppsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_primary_upstream")]
    pub primary: String,
    #[serde(default = "default_fallback_upstream")]
    pub fallback: Option<String>,
    /// Deadline for the whole primary + fallback sequence.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Budget for one upstream attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FiltersConfig {
    #[serde(default = "default_filter_sources")]
    pub sources: Vec<FilterSourceConfig>,
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_hours: u64,
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FilterSourceConfig {
    pub url: String,
    #[serde(default = "default_category")]
    pub category: FilterCategory,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub built_in: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProfileConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub filter_urls: Vec<String>,
    #[serde(default)]
    pub safe_search: bool,
    #[serde(default)]
    pub youtube_restricted: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub id: u32,
    pub profile_id: u32,
    pub start: ClockTime,
    pub end: ClockTime,
    #[serde(default = "default_all_days")]
    pub days: Vec<u8>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FirewallConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Network the device is currently on, until the host reports otherwise.
    #[serde(default)]
    pub network: NetworkType,
    #[serde(default)]
    pub rules: Vec<FirewallRuleConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FirewallRuleConfig {
    pub package: String,
    #[serde(default)]
    pub block_wifi: bool,
    #[serde(default)]
    pub block_mobile_data: bool,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default)]
    pub start: Option<ClockTime>,
    #[serde(default)]
    pub end: Option<ClockTime>,
    #[serde(default = "default_all_days")]
    pub days: Vec<u8>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlockingConfig {
    #[serde(default)]
    pub response: BlockResponse,
    #[serde(default = "default_block_ttl")]
    pub ttl: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enable")]
    pub enable: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppsConfig {
    /// Android-style `packages.list` (package, uid, ...).
    #[serde(default)]
    pub packages_path: Option<String>,
    #[serde(default = "default_proc_net_paths")]
    pub proc_net_paths: Vec<String>,
    /// Display names keyed by package.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_enable")]
    pub enable: bool,
    #[serde(default = "default_log_blocked")]
    pub log_blocked: bool,
    #[serde(default = "default_log_all_queries")]
    pub log_all_queries: bool,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_query_log_sinks")]
    pub query_log_sinks: Vec<String>,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_stats_enable")]
    pub enable: bool,
    #[serde(default = "default_log_interval")]
    pub log_interval_seconds: u64,
}

// Defaults
fn default_listen() -> String {
    "127.0.0.1:5300".to_string()
}
fn default_protocol() -> Protocol {
    Protocol::Doh
}
fn default_primary_upstream() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}
fn default_fallback_upstream() -> Option<String> {
    Some("https://dns.google/dns-query".to_string())
}
fn default_query_timeout_ms() -> u64 {
    5000
}
fn default_attempt_timeout_ms() -> u64 {
    3000
}
fn default_filter_sources() -> Vec<FilterSourceConfig> {
    vec![
        FilterSourceConfig {
            url: "https://raw.githubusercontent.com/StevenBlack/hosts/master/hosts".to_string(),
            category: FilterCategory::Ad,
            enabled: true,
            built_in: true,
        },
        FilterSourceConfig {
            url: "https://urlhaus.abuse.ch/downloads/hostfile/".to_string(),
            category: FilterCategory::Security,
            enabled: true,
            built_in: true,
        },
    ]
}
fn default_false_positive_rate() -> f64 {
    crate::engine::DEFAULT_FALSE_POSITIVE_RATE
}
fn default_refresh_interval() -> u64 {
    24
}
fn default_concurrent_downloads() -> usize {
    4
}
fn default_category() -> FilterCategory {
    FilterCategory::Ad
}
fn default_true() -> bool {
    true
}
fn default_all_days() -> Vec<u8> {
    (1..=7).collect()
}
fn default_block_ttl() -> u32 {
    60
}
fn default_cache_enable() -> bool {
    true
}
fn default_cache_capacity() -> u64 {
    10000
}
fn default_min_ttl() -> u32 {
    30
}
fn default_max_ttl() -> u32 {
    86400
}
fn default_proc_net_paths() -> Vec<String> {
    vec!["/proc/net/udp".to_string(), "/proc/net/udp6".to_string()]
}
fn default_log_enable() -> bool {
    true
}
fn default_log_blocked() -> bool {
    true
}
fn default_log_all_queries() -> bool {
    true
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_query_log_sinks() -> Vec<String> {
    vec!["console".to_string(), "memory".to_string()]
}
fn default_memory_capacity() -> usize {
    500
}
fn default_stats_enable() -> bool {
    true
}
fn default_log_interval() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: UpstreamConfig::default(),
            filters: FiltersConfig::default(),
            custom_rules: vec![],
            whitelist: vec![],
            profiles: vec![],
            active_profile: None,
            schedules: vec![],
            firewall: FirewallConfig::default(),
            blocking: BlockingConfig::default(),
            cache: CacheConfig::default(),
            apps: AppsConfig::default(),
            logging: LoggingConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            primary: default_primary_upstream(),
            fallback: default_fallback_upstream(),
            query_timeout_ms: default_query_timeout_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            sources: default_filter_sources(),
            false_positive_rate: default_false_positive_rate(),
            refresh_interval_hours: default_refresh_interval(),
            concurrent_downloads: default_concurrent_downloads(),
        }
    }
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            response: BlockResponse::default(),
            ttl: default_block_ttl(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable: default_cache_enable(),
            capacity: default_cache_capacity(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
        }
    }
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            packages_path: None,
            proc_net_paths: default_proc_net_paths(),
            labels: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable: default_log_enable(),
            log_blocked: default_log_blocked(),
            log_all_queries: default_log_all_queries(),
            format: default_log_format(),
            level: default_log_level(),
            query_log_sinks: default_query_log_sinks(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enable: default_stats_enable(),
            log_interval_seconds: default_log_interval(),
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config TOML")?;
        Ok(config)
    }
}
