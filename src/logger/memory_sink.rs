use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use super::{DnsErrorEntry, DnsLogEntry, QueryLogSink};

/// Bounded buffer of the most recent records, oldest evicted first.
pub struct MemoryLogSink {
    queries: RwLock<VecDeque<DnsLogEntry>>,
    errors: RwLock<VecDeque<DnsErrorEntry>>,
    capacity: usize,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queries: RwLock::new(VecDeque::with_capacity(capacity)),
            errors: RwLock::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn recent_queries(&self) -> Vec<DnsLogEntry> {
        let buffer = self.queries.read().unwrap_or_else(PoisonError::into_inner);
        buffer.iter().cloned().collect()
    }

    pub fn recent_errors(&self) -> Vec<DnsErrorEntry> {
        let buffer = self.errors.read().unwrap_or_else(PoisonError::into_inner);
        buffer.iter().cloned().collect()
    }

    fn push<T: Clone>(&self, buffer: &RwLock<VecDeque<T>>, entry: &T) {
        let mut buffer = buffer.write().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry.clone());
    }
}

impl QueryLogSink for MemoryLogSink {
    fn log(&self, entry: &DnsLogEntry) {
        self.push(&self.queries, entry);
    }

    fn log_error(&self, entry: &DnsErrorEntry) {
        self.push(&self.errors, entry);
    }
}
