//! Injectable time source.
//!
//! Every component that reasons about time (queue eligibility, cache TTLs,
//! breaker cool-downs, token refill) reads it through [`Clock`] so tests can
//! drive transitions without sleeping. Timestamps are nanoseconds since the
//! Unix epoch, matching the snapshot wire format.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch.
pub type EpochNanos = i64;

/// A monotonic-enough time source. Implementations must never go backwards
/// within a process.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in nanoseconds since the Unix epoch.
    fn now(&self) -> EpochNanos;
}

/// Converts a [`Duration`] to epoch-delta nanoseconds, saturating on overflow.
pub fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// The production clock, backed by [`SystemTime`].
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> EpochNanos {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| nanos(d))
            .unwrap_or(0)
    }
}

/// A hand-advanced clock for tests.
///
/// Starts at an arbitrary positive epoch so that zero-valued timestamps stand
/// out as bugs.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: EpochNanos) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, d: Duration) {
        self.now.fetch_add(nanos(d), Ordering::SeqCst);
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, t: EpochNanos) {
        self.now.store(t, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2021-01-01T00:00:00Z
        Self::new(1_609_459_200_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> EpochNanos {
        self.now.load(Ordering::SeqCst)
    }
}
