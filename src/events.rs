//! # Dispatch Event Stream
//!
//! Structured events emitted at every stage of a request's life. The
//! dispatcher and coordinator publish onto an unbounded channel; the monitor
//! consumes the stream to drive its collectors. Each event is also logged
//! through `tracing` at debug level, so embedding applications get
//! observability without wiring a monitor at all.
//!
//! Emission never blocks and never fails the pipeline: a closed channel
//! (monitor gone during shutdown) drops the event silently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::descriptor::{Priority, RequestId};
use crate::monitor::Alert;
use crate::outcome::OutcomeKind;

/// What happened, with stage-specific payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Submitted {
        priority: Priority,
        url: String,
    },
    Dequeued {
        attempt: u32,
        queued_for: Duration,
    },
    CacheHit,
    CacheMiss,
    BreakerRejected {
        origin: String,
    },
    Attempted {
        attempt: u32,
    },
    Succeeded {
        status: u16,
        attempts: u32,
        duration: Duration,
    },
    Failed {
        outcome: OutcomeKind,
        attempts: u32,
        detail: String,
    },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },
    DeadLettered {
        outcome: OutcomeKind,
    },
    AlertFiring {
        alert: Alert,
    },
    AlertResolved {
        alert: Alert,
    },
}

/// One event on the stream.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEvent {
    /// The descriptor this event concerns; alert transitions carry none.
    pub id: Option<RequestId>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Sending half of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

/// Creates the stream; the receiver goes to the monitor.
pub fn channel() -> (EventBus, mpsc::UnboundedReceiver<DispatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventBus { tx }, rx)
}

impl EventBus {
    pub fn emit(&self, id: Option<RequestId>, kind: EventKind) {
        debug!(request = ?id, event = ?kind, "dispatch event");
        let _ = self.tx.send(DispatchEvent {
            id,
            timestamp: Utc::now(),
            kind,
        });
    }
}
