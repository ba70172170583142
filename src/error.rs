//! Error types shared across the engine.
//!
//! Transport failures are values, never panics: every client returns
//! `Result<Vec<u8>, TransportError>` and the orchestrator branches on it.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failure of a single upstream exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The exchange did not complete within its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Socket, TLS or HTTP level failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// The upstream answered with something that is not a usable DNS response
    /// (bad length prefix, mismatched transaction id, non-2xx status).
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The configured upstream address cannot be used by this transport.
    #[error("invalid upstream '{upstream}': {reason}")]
    InvalidUpstream { upstream: String, reason: String },
}

impl TransportError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::Io(err.to_string())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse(reason.into())
    }

    pub fn invalid_upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUpstream {
            upstream: upstream.into(),
            reason: reason.into(),
        }
    }

    /// Category recorded in [`crate::logger::DnsErrorEntry`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::IoError,
            Self::MalformedResponse(_) | Self::InvalidUpstream { .. } => ErrorKind::Unknown,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Error category of a terminal resolution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    IoError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::IoError => "IO_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Errors raised by filter source management.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unknown filter source {0}")]
    UnknownSource(u32),

    #[error("filter source {0} is built in and cannot be removed")]
    BuiltInSource(u32),

    #[error("filter source already subscribed: {0}")]
    DuplicateSource(String),

    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("index rebuild failed: {0}")]
    IndexBuild(String),
}
