//! Query classification.
//!
//! Precedence, highest first:
//!
//! 1. per-app firewall deny: the query is dropped
//! 2. custom ALLOW rule on the domain or a parent
//! 3. whitelist entry for the exact domain
//! 4. custom BLOCK rule on the domain or a parent
//! 5. filter index hit
//! 6. safe-search / restricted-mode rewrite of the active profile
//! 7. allow

mod firewall;
mod profile;
mod schedule;

pub use firewall::{FirewallPolicy, FirewallRule, NetworkType};
pub use profile::{ProfileChange, ProfileManager, ProfileSchedule, ProtectionProfile};
pub use schedule::{ClockTime, DaySet, TimeWindow};

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{Local, NaiveDateTime};
use hickory_proto::rr::Name;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::domain::normalize_query_name;
use crate::engine::DomainFilterIndex;
use crate::rules::{CustomRuleSet, Whitelist};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    CustomRule,
    Whitelist,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    CustomRule,
    FilterList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Firewall deny: no DNS processing and no response.
    Drop,
    Allow(AllowReason),
    Block(BlockReason),
    /// Answer with a CNAME to this host.
    Rewrite(Name),
}

const SAFE_SEARCH_HOSTS: &[(&str, &str)] = &[
    ("google.com", "forcesafesearch.google.com"),
    ("www.google.com", "forcesafesearch.google.com"),
    ("bing.com", "strict.bing.com"),
    ("www.bing.com", "strict.bing.com"),
    ("duckduckgo.com", "safe.duckduckgo.com"),
    ("www.duckduckgo.com", "safe.duckduckgo.com"),
];

const YOUTUBE_HOSTS: &[(&str, &str)] = &[
    ("youtube.com", "restrict.youtube.com"),
    ("www.youtube.com", "restrict.youtube.com"),
    ("m.youtube.com", "restrict.youtube.com"),
    ("youtubei.googleapis.com", "restrict.youtube.com"),
    ("youtube.googleapis.com", "restrict.youtube.com"),
    ("www.youtube-nocookie.com", "restrict.youtube.com"),
];

/// Exact-host CNAME rewrites.
#[derive(Debug, Default)]
pub struct RewriteMap {
    targets: FxHashMap<Box<str>, Name>,
}

impl RewriteMap {
    pub fn new(safe_search: bool, youtube_restricted: bool) -> Self {
        let mut targets = FxHashMap::default();
        let tables = [(safe_search, SAFE_SEARCH_HOSTS), (youtube_restricted, YOUTUBE_HOSTS)];
        for (_, table) in tables.iter().filter(|(on, _)| *on) {
            for (host, target) in table.iter() {
                if let Ok(name) = Name::from_str(&format!("{}.", target)) {
                    targets.insert((*host).into(), name);
                }
            }
        }
        Self { targets }
    }

    pub fn target(&self, domain: &str) -> Option<&Name> {
        self.targets.get(domain)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Evaluates the precedence above over snapshots that are replaced
/// wholesale, never mutated in place.
pub struct PolicyEngine {
    index: Arc<ArcSwap<DomainFilterIndex>>,
    rules: ArcSwap<CustomRuleSet>,
    whitelist: ArcSwap<Whitelist>,
    firewall: ArcSwap<FirewallPolicy>,
    rewrites: ArcSwap<RewriteMap>,
    network: AtomicU8,
}

impl PolicyEngine {
    /// `index` is shared with the filter repository that installs rebuilds.
    pub fn new(index: Arc<ArcSwap<DomainFilterIndex>>) -> Self {
        Self {
            index,
            rules: ArcSwap::from_pointee(CustomRuleSet::default()),
            whitelist: ArcSwap::from_pointee(Whitelist::default()),
            firewall: ArcSwap::from_pointee(FirewallPolicy::default()),
            rewrites: ArcSwap::from_pointee(RewriteMap::default()),
            network: AtomicU8::new(NetworkType::default().to_u8()),
        }
    }

    pub fn set_rules(&self, rules: CustomRuleSet) {
        self.rules.store(Arc::new(rules));
    }

    pub fn set_whitelist(&self, whitelist: Whitelist) {
        self.whitelist.store(Arc::new(whitelist));
    }

    pub fn set_firewall(&self, firewall: FirewallPolicy) {
        self.firewall.store(Arc::new(firewall));
    }

    pub fn set_rewrites(&self, rewrites: RewriteMap) {
        self.rewrites.store(Arc::new(rewrites));
    }

    pub fn set_network(&self, network: NetworkType) {
        self.network.store(network.to_u8(), Ordering::Relaxed);
    }

    pub fn network(&self) -> NetworkType {
        NetworkType::from_u8(self.network.load(Ordering::Relaxed))
    }

    pub fn rules(&self) -> Arc<CustomRuleSet> {
        self.rules.load_full()
    }

    /// Full evaluation for a query from `package` (if known) at `at`.
    pub fn evaluate(&self, domain: &str, package: Option<&str>, at: &NaiveDateTime) -> Verdict {
        if let Some(package) = package {
            if self.firewall.load().is_denied(package, at, self.network()) {
                return Verdict::Drop;
            }
        }
        self.classify(domain)
    }

    /// Evaluation without the firewall step.
    pub fn classify(&self, domain: &str) -> Verdict {
        let normalized = normalize_query_name(domain);
        let domain = normalized.as_str();
        let rules = self.rules.load();
        if rules.allows(domain) {
            return Verdict::Allow(AllowReason::CustomRule);
        }
        if self.whitelist.load().contains(domain) {
            return Verdict::Allow(AllowReason::Whitelist);
        }
        if rules.blocks(domain) {
            return Verdict::Block(BlockReason::CustomRule);
        }
        if self.index.load().query(domain) {
            return Verdict::Block(BlockReason::FilterList);
        }
        if let Some(target) = self.rewrites.load().target(domain) {
            return Verdict::Rewrite(target.clone());
        }
        Verdict::Allow(AllowReason::Default)
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        matches!(self.classify(domain), Verdict::Block(_))
    }

    /// Convenience for callers without a clock of their own.
    pub fn evaluate_now(&self, domain: &str, package: Option<&str>) -> Verdict {
        self.evaluate(domain, package, &Local::now().naive_local())
    }
}
