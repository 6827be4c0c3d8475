//! # Error Handling
//!
//! Centralized error type for the dispatcher. [`DispatchError`] covers the
//! failures the public API can surface (refused submissions, descriptor
//! validation, snapshot I/O) while per-request results travel as
//! [`DispatchOutcome`](crate::outcome::DispatchOutcome) values, never as
//! errors: a request that fails on the wire is a classified outcome, not a
//! crashed call.
//!
//! The [`Result`] alias keeps signatures short throughout the crate.

use thiserror::Error;

/// A specialized `Result` type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// The error enum for the dispatcher's public surface.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue is at capacity and the caller did not opt into blocking.
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The descriptor's partition is at its registered limit.
    #[error("partition {partition} is full (limit {limit})")]
    PartitionFull { partition: String, limit: usize },

    /// A descriptor failed validation at submit time.
    #[error("invalid request descriptor: {message}")]
    InvalidDescriptor { message: String },

    /// An operation that requires a running coordinator was called while
    /// stopped, or vice versa.
    #[error("coordinator is not in the required state: {message}")]
    Lifecycle { message: String },

    /// A queue snapshot could not be decoded.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    /// Configuration could not be loaded or was rejected.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error, typically from snapshot persistence.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failure (events, status export).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A catch-all for anything else.
    #[error("{0}")]
    Other(String),
}
