//! Dead-letter queue: the terminal sink for descriptors that exhausted
//! retries, expired, or were rejected outright. Bounded FIFO: when full the
//! oldest letter is dropped and a counter records the loss, so the gauge
//! surface never hides discarded work.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

use crate::descriptor::RequestDescriptor;
use crate::outcome::OutcomeKind;

/// One dead-lettered descriptor with its post-mortem.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub descriptor: RequestDescriptor,
    pub outcome: OutcomeKind,
    pub attempts: u32,
    /// Last-attempt detail: status line, transport error, or expiry reason.
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded FIFO of dead letters.
pub struct DeadLetterQueue {
    max_size: usize,
    inner: Mutex<VecDeque<DeadLetter>>,
    dropped: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            inner: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(
        &self,
        descriptor: RequestDescriptor,
        outcome: OutcomeKind,
        attempts: u32,
        detail: impl Into<String>,
    ) {
        let letter = DeadLetter {
            descriptor,
            outcome,
            attempts,
            detail: detail.into(),
            timestamp: Utc::now(),
        };
        warn!(
            id = %letter.descriptor.id,
            outcome = %letter.outcome,
            attempts = letter.attempts,
            "request dead-lettered"
        );

        let mut inner = self.inner.lock().unwrap();
        if inner.len() >= self.max_size {
            inner.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.push_back(letter);
    }

    /// All retained letters, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    /// Removes and returns the letter at `index` (oldest first), for replay.
    pub fn take(&self, index: usize) -> Option<DeadLetter> {
        self.inner.lock().unwrap().remove(index)
    }

    /// Puts a taken letter back at the old end, without re-logging it.
    pub(crate) fn reinsert(&self, letter: DeadLetter) {
        self.inner.lock().unwrap().push_front(letter);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Letters lost to the capacity bound since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
