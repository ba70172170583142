use chrono::{DateTime, Local};
use hickory_proto::rr::RecordType;

use crate::error::ErrorKind;
use crate::policy::BlockReason;

#[derive(Debug, Clone)]
pub struct DnsLogEntry {
    pub domain: String,
    pub timestamp: DateTime<Local>,
    pub query_type: RecordType,
    pub action: LogAction,
    pub reason: Option<BlockReason>,
    pub blocked: bool,
    pub response_time_ms: u64,
    /// Empty when the sending app is unknown.
    pub app_name: String,
    pub upstream: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogAction {
    Blocked,
    Forwarded,
    Cached,
    Rewritten,
    FirewallDropped,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LogAction::Blocked => "blocked",
            LogAction::Forwarded => "forwarded",
            LogAction::Cached => "cached",
            LogAction::Rewritten => "rewritten",
            LogAction::FirewallDropped => "firewall_dropped",
        }
    }
}

/// A query that got no answer because every upstream attempt failed.
#[derive(Debug, Clone)]
pub struct DnsErrorEntry {
    pub domain: String,
    pub timestamp: DateTime<Local>,
    pub query_type: RecordType,
    pub kind: ErrorKind,
    pub upstream: String,
    pub fallback_attempted: bool,
    pub message: String,
    pub app_name: String,
}

pub trait QueryLogSink: Send + Sync {
    fn log(&self, entry: &DnsLogEntry);
    fn log_error(&self, entry: &DnsErrorEntry);
}
