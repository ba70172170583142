use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::info;

/// Which configured upstream answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamRole {
    Primary,
    Fallback,
}

impl UpstreamRole {
    fn slot(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Fallback => 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    total_queries: AtomicU64,
    blocked_by_list: AtomicU64,
    blocked_by_rule: AtomicU64,
    firewall_dropped: AtomicU64,
    forwarded: AtomicU64,
    rewritten: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,

    // Indexed by UpstreamRole::slot.
    upstream_total_ms: [AtomicU64; 2],
    upstream_count: [AtomicU64; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_queries: u64,
    pub blocked_by_list: u64,
    pub blocked_by_rule: u64,
    pub firewall_dropped: u64,
    pub forwarded: u64,
    pub rewritten: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub primary_avg_ms: Option<f64>,
    pub fallback_avg_ms: Option<f64>,
}

impl StatsSnapshot {
    pub fn blocked(&self) -> u64 {
        self.blocked_by_list + self.blocked_by_rule
    }
}

impl StatsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Dump counters through `tracing` every `interval`.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.dump_stats();
            }
        })
    }

    pub fn inc_queries(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_by_list(&self) {
        self.blocked_by_list.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_by_rule(&self) {
        self.blocked_by_rule.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_firewall_dropped(&self) {
        self.firewall_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rewritten(&self) {
        self.rewritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_latency(&self, role: UpstreamRole, ms: u64) {
        let slot = role.slot();
        self.upstream_total_ms[slot].fetch_add(ms, Ordering::Relaxed);
        self.upstream_count[slot].fetch_add(1, Ordering::Relaxed);
    }

    fn avg_ms(&self, role: UpstreamRole) -> Option<f64> {
        let slot = role.slot();
        let count = self.upstream_count[slot].load(Ordering::Relaxed);
        (count > 0).then(|| self.upstream_total_ms[slot].load(Ordering::Relaxed) as f64 / count as f64)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            blocked_by_list: self.blocked_by_list.load(Ordering::Relaxed),
            blocked_by_rule: self.blocked_by_rule.load(Ordering::Relaxed),
            firewall_dropped: self.firewall_dropped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            rewritten: self.rewritten.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            primary_avg_ms: self.avg_ms(UpstreamRole::Primary),
            fallback_avg_ms: self.avg_ms(UpstreamRole::Fallback),
        }
    }

    fn dump_stats(&self) {
        let s = self.snapshot();
        let pct = |n: u64| {
            if s.total_queries > 0 {
                (n as f64 / s.total_queries as f64) * 100.0
            } else {
                0.0
            }
        };

        let mut upstream_stats = String::new();
        if let Some(avg) = s.primary_avg_ms {
            upstream_stats.push_str(&format!("[primary: {:.1}ms] ", avg));
        }
        if let Some(avg) = s.fallback_avg_ms {
            upstream_stats.push_str(&format!("[fallback: {:.1}ms] ", avg));
        }

        info!(
            "STATS DUMP: Total: {}, Blocked: {} ({:.1}%, list {}, rule {}), FirewallDropped: {}, Rewritten: {}, CacheHits: {} ({:.1}%), Failures: {}, Upstreams: {}",
            s.total_queries,
            s.blocked(),
            pct(s.blocked()),
            s.blocked_by_list,
            s.blocked_by_rule,
            s.firewall_dropped,
            s.rewritten,
            s.cache_hits,
            pct(s.cache_hits),
            s.failures,
            upstream_stats
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_latency() {
        let stats = StatsCollector::new();
        stats.inc_queries();
        stats.inc_queries();
        stats.inc_blocked_by_list();
        stats.inc_blocked_by_rule();
        stats.record_upstream_latency(UpstreamRole::Primary, 10);
        stats.record_upstream_latency(UpstreamRole::Primary, 30);

        let snap = stats.snapshot();
        assert_eq!(snap.total_queries, 2);
        assert_eq!(snap.blocked(), 2);
        assert_eq!(snap.primary_avg_ms, Some(20.0));
        assert_eq!(snap.fallback_avg_ms, None);
    }
}
