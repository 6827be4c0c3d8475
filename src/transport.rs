//! # Transport Abstraction
//!
//! A thin boundary for the actual HTTP I/O. The engine depends on the
//! [`Transport`] trait for exactly one thing: performing a single request
//! attempt. Connection pooling, redirects and TLS are the implementation's
//! business; the engine treats it as a black box that returns outcomes and
//! never throws across the boundary.
//!
//! Tests (and examples) use [`MockTransport`], which replays scripted results
//! and records every wire call it receives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::descriptor::{RequestDescriptor, RequestId};

/// Classification of a failed attempt, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Connect,
    Tls,
    Timeout,
    Dns,
    Protocol,
    Canceled,
    Other,
}

/// A completed attempt: the full buffered response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

/// A failed attempt.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub kind: TransportErrorKind,
    pub message: String,
    pub elapsed: Duration,
}

/// Result of one wire attempt.
pub type TransportResult = std::result::Result<TransportResponse, TransportFailure>;

/// Performs a single HTTP request attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request, honoring `deadline` as the attempt budget.
    ///
    /// Implementations report failures as [`TransportFailure`] values; the
    /// dispatcher additionally enforces the deadline from the outside.
    async fn send(&self, descriptor: &RequestDescriptor, deadline: Duration) -> TransportResult;
}

/// One scripted reply for [`MockTransport`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Status(u16),
    StatusWithHeaders(u16, Vec<(String, String)>),
    Failure(TransportErrorKind),
}

impl Scripted {
    fn materialize(&self, elapsed: Duration) -> TransportResult {
        match self {
            Scripted::Status(status) => Ok(TransportResponse {
                status: *status,
                headers: BTreeMap::new(),
                body: b"{}".to_vec(),
                elapsed,
            }),
            Scripted::StatusWithHeaders(status, headers) => Ok(TransportResponse {
                status: *status,
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                body: b"{}".to_vec(),
                elapsed,
            }),
            Scripted::Failure(kind) => Err(TransportFailure {
                kind: *kind,
                message: format!("scripted {kind:?} failure"),
                elapsed,
            }),
        }
    }
}

/// A record of one wire call the mock received.
#[derive(Debug, Clone)]
pub struct WireCall {
    pub id: RequestId,
    pub url: String,
}

/// Scripted transport for tests.
///
/// Replies are served from a per-instance sequence; when the sequence runs
/// dry the last entry repeats. An optional artificial latency simulates slow
/// upstreams for single-flight and timeout tests.
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    latency: Duration,
    sent: AtomicUsize,
    calls: Mutex<Vec<WireCall>>,
}

impl MockTransport {
    /// Replies with `status` to every call.
    pub fn always(status: u16) -> Self {
        Self::sequence(vec![Scripted::Status(status)])
    }

    /// Replays `script` in order, repeating the final entry forever.
    pub fn sequence(script: Vec<Scripted>) -> Self {
        let fallback = script
            .last()
            .cloned()
            .unwrap_or(Scripted::Status(200));
        Self {
            script: Mutex::new(script.into()),
            fallback,
            latency: Duration::ZERO,
            sent: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails every call with `kind`.
    pub fn failing(kind: TransportErrorKind) -> Self {
        Self::sequence(vec![Scripted::Failure(kind)])
    }

    /// Adds artificial latency to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Total wire calls received.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Wire calls received, in arrival order.
    pub fn calls(&self) -> Vec<WireCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Wire calls received for one descriptor.
    pub fn calls_for(&self, id: RequestId) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.id == id).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, descriptor: &RequestDescriptor, _deadline: Duration) -> TransportResult {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(WireCall {
            id: descriptor.id,
            url: descriptor.url.clone(),
        });

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        reply.materialize(self.latency)
    }
}
