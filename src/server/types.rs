use std::sync::Arc;
use std::time::Instant;

use hickory_proto::rr::RecordType;

use crate::logger::LogAction;
use crate::policy::BlockReason;

#[derive(Clone)]
pub struct QueryContext {
    pub name: Arc<str>,
    pub qtype: RecordType,
    pub app_name: String,
    pub start: Instant,
}

pub struct LogContext {
    pub action: LogAction,
    pub reason: Option<BlockReason>,
    pub upstream: Option<Arc<str>>,
}
