use tracing::{info, warn};

use crate::config::LoggingConfig;
use crate::logger::types::{DnsErrorEntry, DnsLogEntry, LogAction, QueryLogSink};
use crate::policy::BlockReason;

pub struct ConsoleLogSink {
    config: LoggingConfig,
}

impl ConsoleLogSink {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    fn app_label(app_name: &str) -> &str {
        if app_name.is_empty() {
            "-"
        } else {
            app_name
        }
    }
}

impl QueryLogSink for ConsoleLogSink {
    fn log(&self, entry: &DnsLogEntry) {
        if !self.config.enable {
            return;
        }

        let should_log = match entry.action {
            LogAction::Blocked | LogAction::FirewallDropped => self.config.log_blocked,
            _ => self.config.log_all_queries,
        };
        if !should_log {
            return;
        }

        if self.config.format == "json" {
            info!(
                target: "dns_query",
                domain = %entry.domain,
                r#type = %entry.query_type,
                action = entry.action.as_str(),
                reason = ?entry.reason,
                blocked = entry.blocked,
                app = %entry.app_name,
                upstream = ?entry.upstream,
                lat = entry.response_time_ms,
                ts = %entry.timestamp.to_rfc3339()
            );
            return;
        }

        let action_str = match entry.action {
            LogAction::Blocked => match entry.reason {
                Some(BlockReason::CustomRule) => "blocked by custom rule".to_string(),
                _ => "blocked by filter list".to_string(),
            },
            LogAction::FirewallDropped => "dropped by app firewall".to_string(),
            LogAction::Cached => "fetched from cache".to_string(),
            LogAction::Rewritten => match entry.upstream {
                Some(ref up) => format!("rewritten, target resolved via {}", up),
                None => "rewritten".to_string(),
            },
            LogAction::Forwarded => match entry.upstream {
                Some(ref up) => format!("fetched from upstream {}", up),
                None => "fetched from upstream".to_string(),
            },
        };

        info!(
            target: "dns_query",
            "[{}] {} {} -> {} [{}ms]",
            entry.query_type,
            Self::app_label(&entry.app_name),
            entry.domain,
            action_str,
            entry.response_time_ms
        );
    }

    fn log_error(&self, entry: &DnsErrorEntry) {
        if !self.config.enable {
            return;
        }

        if self.config.format == "json" {
            warn!(
                target: "dns_error",
                domain = %entry.domain,
                r#type = %entry.query_type,
                kind = entry.kind.as_str(),
                upstream = %entry.upstream,
                fallback = entry.fallback_attempted,
                app = %entry.app_name,
                error = %entry.message,
                ts = %entry.timestamp.to_rfc3339()
            );
        } else {
            warn!(
                target: "dns_error",
                "[{}] {} {} -> {} via {} (fallback tried: {}): {}",
                entry.query_type,
                Self::app_label(&entry.app_name),
                entry.domain,
                entry.kind.as_str(),
                entry.upstream,
                entry.fallback_attempted,
                entry.message
            );
        }
    }
}
