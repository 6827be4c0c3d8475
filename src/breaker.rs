//! # Per-Origin Circuit Breakers
//!
//! Failure isolation keyed by (scheme, host, port). Each origin's breaker is
//! a small state machine: CLOSED until consecutive failures reach the
//! threshold, OPEN for the cool-down window, then HALF_OPEN where a bounded
//! number of probes decide between closing and re-opening.
//!
//! The registry applies events in arrival order under one lock; no await
//! happens while it is held. What counts as a failure is the dispatcher's
//! call (transport errors, timeouts and 5xx; a 4xx is the client's defect,
//! not the server's), the breaker only folds the verdicts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::clock::{nanos, EpochNanos};
use crate::config::BreakerConfig;
use crate::descriptor::Origin;

/// Breaker state for one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerCell {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: EpochNanos,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl Default for BreakerCell {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: 0,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }
}

/// Proof that a request was admitted; hand it back with the verdict so
/// half-open probe slots are released exactly once.
#[derive(Debug, Clone)]
pub struct Admission {
    pub origin: Origin,
    half_open: bool,
}

impl Admission {
    pub fn is_probe(&self) -> bool {
        self.half_open
    }
}

/// Point-in-time view of one breaker, for `status()` surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_in_flight: u32,
}

/// All per-origin breakers behind one lock.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    cells: Mutex<HashMap<Origin, BreakerCell>>,
    total_opens: AtomicU64,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: Mutex::new(HashMap::new()),
            total_opens: AtomicU64::new(0),
        }
    }

    /// Admission check for `origin`. `Err(())` means the circuit rejects the
    /// request and the caller classifies it `CircuitOpen` without touching
    /// the wire.
    pub fn admit(&self, origin: &Origin, now: EpochNanos) -> Result<Admission, ()> {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(origin.clone()).or_default();

        if cell.state == BreakerState::Open {
            if now.saturating_sub(cell.opened_at) >= nanos(self.config.timeout) {
                cell.state = BreakerState::HalfOpen;
                cell.half_open_in_flight = 0;
                cell.half_open_successes = 0;
            } else {
                return Err(());
            }
        }

        match cell.state {
            BreakerState::Closed => Ok(Admission {
                origin: origin.clone(),
                half_open: false,
            }),
            BreakerState::HalfOpen => {
                if cell.half_open_in_flight < self.config.half_open_max_calls {
                    cell.half_open_in_flight += 1;
                    Ok(Admission {
                        origin: origin.clone(),
                        half_open: true,
                    })
                } else {
                    Err(())
                }
            }
            BreakerState::Open => Err(()),
        }
    }

    /// Records a successful attempt for the admission's origin.
    pub fn on_success(&self, admission: &Admission) {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(admission.origin.clone()).or_default();

        if admission.half_open {
            cell.half_open_in_flight = cell.half_open_in_flight.saturating_sub(1);
        }

        match cell.state {
            BreakerState::Closed => cell.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                if admission.half_open {
                    cell.half_open_successes += 1;
                    if cell.half_open_successes >= self.config.probe_required {
                        // Recovered: subsequent failures accumulate from zero.
                        *cell = BreakerCell::default();
                    }
                }
            }
            // A stale success cannot close an open circuit.
            BreakerState::Open => {}
        }
    }

    /// Records a failed attempt for the admission's origin.
    pub fn on_failure(&self, admission: &Admission, now: EpochNanos) {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells.entry(admission.origin.clone()).or_default();

        if admission.half_open {
            cell.half_open_in_flight = cell.half_open_in_flight.saturating_sub(1);
        }

        match cell.state {
            BreakerState::HalfOpen => {
                cell.state = BreakerState::Open;
                cell.opened_at = now;
                cell.half_open_in_flight = 0;
                cell.half_open_successes = 0;
                self.total_opens.fetch_add(1, Ordering::Relaxed);
            }
            BreakerState::Closed => {
                cell.consecutive_failures += 1;
                if cell.consecutive_failures >= self.config.failure_threshold {
                    cell.state = BreakerState::Open;
                    cell.opened_at = now;
                    self.total_opens.fetch_add(1, Ordering::Relaxed);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Releases an admission that produced no verdict (the attempt was
    /// cancelled before reaching the wire). Only the probe slot is returned;
    /// no state transition happens.
    pub fn on_abandon(&self, admission: &Admission) {
        if !admission.half_open {
            return;
        }
        let mut cells = self.cells.lock().unwrap();
        if let Some(cell) = cells.get_mut(&admission.origin) {
            cell.half_open_in_flight = cell.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Current state for one origin; `Closed` when unseen.
    pub fn state_of(&self, origin: &Origin) -> BreakerState {
        self.cells
            .lock()
            .unwrap()
            .get(origin)
            .map(|c| c.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Number of origins currently OPEN.
    pub fn open_count(&self) -> usize {
        self.cells
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.state == BreakerState::Open)
            .count()
    }

    /// Total CLOSED/HALF_OPEN → OPEN transitions since startup.
    pub fn total_opens(&self) -> u64 {
        self.total_opens.load(Ordering::Relaxed)
    }

    /// Per-origin snapshots for status reporting.
    pub fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        self.cells
            .lock()
            .unwrap()
            .iter()
            .map(|(origin, cell)| {
                (
                    origin.to_string(),
                    BreakerSnapshot {
                        state: cell.state,
                        consecutive_failures: cell.consecutive_failures,
                        half_open_in_flight: cell.half_open_in_flight,
                    },
                )
            })
            .collect()
    }
}
