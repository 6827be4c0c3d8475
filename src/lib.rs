//! # dispatchq
//!
//! A priority-aware, rate-limited, fault-tolerant HTTP request dispatcher
//! for automation workloads: bulk API calls, health probes, integration
//! tests. Client code submits typed request descriptors; the engine
//! schedules, sends, retries, caches and reports them under configurable
//! concurrency and failure policies.
//!
//! ## Core Concepts
//!
//! - **[`Coordinator`]**: the engine's lifecycle owner and API surface.
//!   `submit` returns a [`RequestHandle`] that resolves with the request's
//!   terminal [`DispatchOutcome`].
//! - **[`RequestDescriptor`]**: an immutable, validated description of one
//!   HTTP request: method, URL, headers, body, timeout, priority, tags.
//! - **[`Transport`]**: the seam to the actual HTTP client. The engine only
//!   asks it to perform single attempts; [`MockTransport`] scripts them for
//!   tests.
//! - **Resilience**: a strict-priority queue with delayed retry eligibility,
//!   a global token bucket, per-origin circuit breakers, exponential backoff
//!   with `Retry-After` support, and a TTL/LRU response cache with
//!   single-flight coalescing.
//! - **Observability**: a structured event stream feeding a [`Monitor`] with
//!   counters, gauges, rolling histograms, threshold alerts and a derived
//!   health scalar.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use dispatchq::{ConfigBuilder, Coordinator, Priority, RequestDescriptor};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(transport: Arc<dyn dispatchq::Transport>) -> dispatchq::Result<()> {
//! let config = ConfigBuilder::new()
//!     .workers(8)
//!     .rate_limit(50)
//!     .build();
//! let coordinator = Coordinator::new(config, transport);
//! coordinator.start()?;
//!
//! let handle = coordinator.submit(
//!     RequestDescriptor::get("https://api.example.com/health").build()?,
//!     Priority::High,
//! )?;
//! let outcome = handle.outcome().await;
//! println!("finished: {:?}", outcome.kind());
//!
//! coordinator.stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod outcome;
pub mod queue;
pub mod rate;
pub mod retry;
pub mod snapshot;
pub mod transport;

// Re-export the surface most callers need.
pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigBuilder, DispatchConfig};
pub use coordinator::{join_all, Coordinator, RequestHandle, Status};
pub use descriptor::{Method, Origin, Priority, RequestDescriptor, RequestId};
pub use dispatcher::InflightTracker;
pub use dlq::DeadLetter;
pub use error::{DispatchError, Result};
pub use events::{DispatchEvent, EventKind};
pub use monitor::{
    Alert, AlertSink, AlertStatus, Comparator, Health, Monitor, Severity, ThresholdRule,
};
pub use outcome::{DispatchOutcome, OutcomeKind, ResponseRecord};
pub use transport::{
    MockTransport, Scripted, Transport, TransportErrorKind, TransportFailure, TransportResponse,
};
