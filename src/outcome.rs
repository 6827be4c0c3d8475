//! # Request Outcomes
//!
//! The terminal result of a dispatched request. Every descriptor resolves to
//! exactly one [`DispatchOutcome`]: a completed [`ResponseRecord`] or a
//! classified failure. Workers classify, they never throw: the transport
//! returns outcomes across the boundary and the engine folds them into this
//! taxonomy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Classification of how a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// 2xx, or any status configured as success.
    Success,
    /// Non-success status that exhausted or bypassed retries.
    HttpError,
    /// The attempt exceeded the per-request timeout.
    Timeout,
    /// Network/TLS/DNS failure reported by the transport.
    TransportError,
    /// Rejected by an open circuit breaker; never retried.
    CircuitOpen,
    /// 429 after exhausting retries.
    RateLimited,
    /// The entry crossed its wall-clock expiry before dispatch.
    Expired,
    /// Explicit cancel or shutdown.
    Canceled,
    /// Submission refused at capacity.
    QueueFull,
}

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Success)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::HttpError => "http_error",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::TransportError => "transport_error",
            OutcomeKind::CircuitOpen => "circuit_open",
            OutcomeKind::RateLimited => "rate_limited",
            OutcomeKind::Expired => "expired",
            OutcomeKind::Canceled => "canceled",
            OutcomeKind::QueueFull => "queue_full",
        };
        f.write_str(s)
    }
}

/// A buffered response plus dispatch bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Attempts the descriptor took, including the successful one.
    pub attempts: u32,
    /// Wall time from submission to completion.
    pub total_time: Duration,
    /// Whether this record was served from the cache.
    pub cache_hit: bool,
    pub outcome: OutcomeKind,
}

impl ResponseRecord {
    /// Case-insensitive response header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let wanted = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == wanted)
            .map(|(_, v)| v.as_str())
    }

    /// A copy marked as served from the cache.
    pub(crate) fn as_cache_hit(&self) -> ResponseRecord {
        let mut record = self.clone();
        record.cache_hit = true;
        record
    }
}

/// The terminal result a submission handle resolves with.
///
/// Clonable so single-flight followers can share the leader's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DispatchOutcome {
    Completed(ResponseRecord),
    Failed {
        kind: OutcomeKind,
        attempts: u32,
        /// Last-attempt detail: status line, transport error text, or reason.
        detail: String,
    },
}

impl DispatchOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            DispatchOutcome::Completed(record) => record.outcome,
            DispatchOutcome::Failed { kind, .. } => *kind,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind().is_success()
    }

    pub fn record(&self) -> Option<&ResponseRecord> {
        match self {
            DispatchOutcome::Completed(record) => Some(record),
            DispatchOutcome::Failed { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DispatchOutcome::Completed(record) => record.attempts,
            DispatchOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub(crate) fn failed(kind: OutcomeKind, attempts: u32, detail: impl Into<String>) -> Self {
        DispatchOutcome::Failed {
            kind,
            attempts,
            detail: detail.into(),
        }
    }
}
