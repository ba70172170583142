pub mod console_sink;
pub mod memory_sink;
pub mod types;

pub use self::console_sink::ConsoleLogSink;
pub use self::memory_sink::MemoryLogSink;
pub use self::types::{DnsErrorEntry, DnsLogEntry, LogAction, QueryLogSink};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::LoggingConfig;

const SINK_BUFFER: usize = 1000;

#[derive(Debug, Clone)]
enum LogRecord {
    Query(DnsLogEntry),
    Error(DnsErrorEntry),
}

/// Fans records out to every configured sink. Logging never blocks the
/// query path: a full sink buffer drops the record.
pub struct QueryLogger {
    sinks: Vec<mpsc::Sender<LogRecord>>,
    memory: Option<Arc<MemoryLogSink>>,
}

impl QueryLogger {
    /// Must be called inside a tokio runtime.
    pub fn new(config: &LoggingConfig) -> Arc<Self> {
        let mut sinks: Vec<Arc<dyn QueryLogSink>> = Vec::new();
        let mut memory = None;

        for sink_type in &config.query_log_sinks {
            match sink_type.as_str() {
                "console" => sinks.push(Arc::new(ConsoleLogSink::new(config.clone()))),
                "memory" => {
                    let sink = Arc::new(MemoryLogSink::new(config.memory_capacity));
                    memory = Some(sink.clone());
                    sinks.push(sink);
                }
                other => warn!("Unknown log sink type: {}", other),
            }
        }

        Arc::new(Self::spawn(sinks, memory))
    }

    pub fn with_sinks(sinks: Vec<Arc<dyn QueryLogSink>>) -> Arc<Self> {
        Arc::new(Self::spawn(sinks, None))
    }

    fn spawn(sinks: Vec<Arc<dyn QueryLogSink>>, memory: Option<Arc<MemoryLogSink>>) -> Self {
        let senders = sinks
            .into_iter()
            .map(|sink| {
                let (tx, mut rx) = mpsc::channel::<LogRecord>(SINK_BUFFER);
                tokio::spawn(async move {
                    while let Some(record) = rx.recv().await {
                        match record {
                            LogRecord::Query(entry) => sink.log(&entry),
                            LogRecord::Error(entry) => sink.log_error(&entry),
                        }
                    }
                });
                tx
            })
            .collect();
        Self {
            sinks: senders,
            memory,
        }
    }

    /// The in-memory sink, when configured.
    pub fn memory(&self) -> Option<&Arc<MemoryLogSink>> {
        self.memory.as_ref()
    }

    pub fn log(&self, entry: DnsLogEntry) {
        self.dispatch(LogRecord::Query(entry));
    }

    pub fn log_error(&self, entry: DnsErrorEntry) {
        self.dispatch(LogRecord::Error(entry));
    }

    fn dispatch(&self, record: LogRecord) {
        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            let _ = sink.try_send(record.clone());
        }
        let _ = last.try_send(record);
    }
}
