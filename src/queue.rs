//! # Priority Queue
//!
//! The pending-request store: one binary heap per priority band, each keyed
//! by `(next_eligible_ts, sequence)`. Dequeue serves the lowest band holding
//! a ready entry: priority is strict, and a busy CRITICAL band starves lower
//! bands. Within a band, ties resolve FIFO by sequence.
//!
//! Blocking is cooperative: state lives under a plain mutex and a
//! [`Notify`] plays the condition-variable role: waiters register interest
//! before re-checking state, then park until a new entry, a close, or the
//! earliest eligibility timestamp. No await ever holds the lock.
//!
//! Cancellation uses tombstones: `remove` marks the id and the slot is
//! physically dropped when a pop encounters it, keeping removal O(1) without
//! re-heapifying.
//!
//! Descriptors may carry a partition label. Partitions with a registered
//! limit cap how many of their entries may be pending at once; admission
//! fails with `PartitionFull` at the cap. Dispatch order stays global across
//! partitions.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::clock::{Clock, EpochNanos};
use crate::descriptor::{RequestDescriptor, RequestId};
use crate::error::{DispatchError, Result};
use crate::snapshot::{self, SnapshotError};

/// A descriptor with its scheduling envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub descriptor: RequestDescriptor,
    /// Enqueue tie-breaker, monotonically increasing.
    pub sequence: u64,
    /// 1-based attempt this dequeue will perform.
    pub attempt: u32,
    /// Earliest dispatch time; delayed retries land in the future.
    pub next_eligible_ts: EpochNanos,
    /// Wall-clock deadline; entries past it dead-letter instead of dispatching.
    pub expiry_ts: EpochNanos,
}

struct HeapSlot(QueueEntry);

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    // BinaryHeap is a max-heap; invert so the earliest key is on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.0.next_eligible_ts, other.0.sequence)
            .cmp(&(self.0.next_eligible_ts, self.0.sequence))
    }
}

#[derive(Default)]
struct Inner {
    bands: [BinaryHeap<HeapSlot>; 4],
    /// Entries neither dequeued nor tombstoned.
    live: usize,
    next_sequence: u64,
    /// Pending ids, with the partition each was admitted under.
    queued: HashMap<RequestId, Option<String>>,
    tombstones: HashSet<RequestId>,
    partition_counts: HashMap<String, usize>,
    partition_limits: HashMap<String, usize>,
    closed: bool,
}

impl Inner {
    /// Pops the minimum-ordered ready entry, dropping tombstoned slots on the
    /// way. Returns the earliest future eligibility when nothing is ready.
    fn pop_ready(&mut self, now: EpochNanos) -> (Option<QueueEntry>, Option<EpochNanos>) {
        enum Top {
            Tombstoned,
            Ready,
            NotYet(EpochNanos),
        }

        let mut earliest: Option<EpochNanos> = None;
        for band_idx in 0..self.bands.len() {
            loop {
                let top = match self.bands[band_idx].peek() {
                    None => break,
                    Some(slot) if self.tombstones.contains(&slot.0.descriptor.id) => {
                        Top::Tombstoned
                    }
                    Some(slot) if slot.0.next_eligible_ts <= now => Top::Ready,
                    Some(slot) => Top::NotYet(slot.0.next_eligible_ts),
                };
                match top {
                    Top::Tombstoned => {
                        if let Some(slot) = self.bands[band_idx].pop() {
                            self.tombstones.remove(&slot.0.descriptor.id);
                        }
                    }
                    Top::Ready => {
                        if let Some(slot) = self.bands[band_idx].pop() {
                            self.live -= 1;
                            if let Some(partition) = self.queued.remove(&slot.0.descriptor.id) {
                                self.release_partition(partition);
                            }
                            return (Some(slot.0), None);
                        }
                    }
                    Top::NotYet(ts) => {
                        earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
                        break;
                    }
                }
            }
        }
        (None, earliest)
    }

    fn admit_partition(&mut self, partition: &Option<String>) -> Result<()> {
        if let Some(partition) = partition {
            if let Some(limit) = self.partition_limits.get(partition) {
                let count = self.partition_counts.get(partition).copied().unwrap_or(0);
                if count >= *limit {
                    return Err(DispatchError::PartitionFull {
                        partition: partition.clone(),
                        limit: *limit,
                    });
                }
            }
            *self.partition_counts.entry(partition.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn release_partition(&mut self, partition: Option<String>) {
        if let Some(partition) = partition {
            if let Some(count) = self.partition_counts.get_mut(&partition) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.partition_counts.remove(&partition);
                }
            }
        }
    }
}

/// Concurrent multi-band ordered collection of pending requests.
pub struct PriorityQueue {
    max_size: usize,
    inner: Mutex<Inner>,
    /// Wakes dequeue waiters on enqueue and close.
    ready: Notify,
    /// Wakes blocking submitters when capacity frees up.
    space: Notify,
    clock: Arc<dyn Clock>,
}

impl PriorityQueue {
    pub fn new(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            space: Notify::new(),
            clock,
        }
    }

    /// Admits a descriptor. Fails with `QueueFull` at capacity, with
    /// `PartitionFull` at the descriptor's partition limit, and with a
    /// lifecycle error once the queue is closed.
    pub fn enqueue(
        &self,
        descriptor: RequestDescriptor,
        attempt: u32,
        next_eligible_ts: EpochNanos,
        expiry_ts: EpochNanos,
    ) -> Result<u64> {
        let sequence = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(DispatchError::Lifecycle {
                    message: "queue is closed".to_string(),
                });
            }
            if inner.live >= self.max_size {
                return Err(DispatchError::QueueFull {
                    capacity: self.max_size,
                });
            }
            inner.admit_partition(&descriptor.partition)?;
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.queued.insert(descriptor.id, descriptor.partition.clone());
            inner.live += 1;
            let band = descriptor.priority.band();
            inner.bands[band].push(HeapSlot(QueueEntry {
                descriptor,
                sequence,
                attempt,
                next_eligible_ts,
                expiry_ts,
            }));
            sequence
        };
        self.ready.notify_one();
        Ok(sequence)
    }

    /// Like [`enqueue`](Self::enqueue), but waits for capacity instead of
    /// failing with `QueueFull`. Partition limits still fail fast.
    pub async fn enqueue_wait(
        &self,
        descriptor: RequestDescriptor,
        attempt: u32,
        next_eligible_ts: EpochNanos,
        expiry_ts: EpochNanos,
    ) -> Result<u64> {
        loop {
            let waiter = self.space.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();

            match self.enqueue(descriptor.clone(), attempt, next_eligible_ts, expiry_ts) {
                Ok(sequence) => return Ok(sequence),
                Err(DispatchError::QueueFull { .. }) => waiter.await,
                Err(other) => return Err(other),
            }
        }
    }

    /// Non-blocking dequeue of the minimum-ordered ready entry.
    pub fn poll_ready(&self, now: EpochNanos) -> Option<QueueEntry> {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            inner.pop_ready(now).0
        };
        if entry.is_some() {
            self.space.notify_one();
        }
        entry
    }

    /// Dequeues the next ready entry, cooperatively blocking while none is
    /// eligible. Returns `None` once the queue is closed and drained.
    pub async fn dequeue_ready(&self) -> Option<QueueEntry> {
        loop {
            let waiter = self.ready.notified();
            tokio::pin!(waiter);
            // Register before checking state so an enqueue racing this check
            // cannot be missed.
            waiter.as_mut().enable();

            let (entry, earliest, finished) = {
                let mut inner = self.inner.lock().unwrap();
                let now = self.clock.now();
                let (entry, earliest) = inner.pop_ready(now);
                let finished = entry.is_none() && inner.closed && inner.live == 0;
                (entry, earliest, finished)
            };

            if let Some(entry) = entry {
                self.space.notify_one();
                return Some(entry);
            }
            if finished {
                return None;
            }

            match earliest {
                Some(ts) => {
                    let now = self.clock.now();
                    let wait = Duration::from_nanos(ts.saturating_sub(now).max(0) as u64);
                    let _ = tokio::time::timeout(wait.max(Duration::from_millis(1)), waiter).await;
                }
                None => waiter.await,
            }
        }
    }

    /// Tombstones a queued entry. Returns `false` when the id is no longer
    /// queued (already dispatched or never seen).
    pub fn remove(&self, id: RequestId) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.queued.remove(&id) {
                Some(partition) => {
                    inner.tombstones.insert(id);
                    inner.live -= 1;
                    inner.release_partition(partition);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.space.notify_one();
        }
        removed
    }

    /// Removes entries whose expiry passed; the caller routes them to the
    /// dead-letter queue.
    pub fn purge_expired(&self, now: EpochNanos) -> Vec<QueueEntry> {
        let mut expired = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for band in 0..inner.bands.len() {
            let drained = std::mem::take(&mut inner.bands[band]);
            for slot in drained {
                let id = slot.0.descriptor.id;
                if inner.tombstones.remove(&id) {
                    continue;
                }
                if slot.0.expiry_ts <= now {
                    if let Some(partition) = inner.queued.remove(&id) {
                        inner.release_partition(partition);
                    }
                    inner.live -= 1;
                    expired.push(slot.0);
                } else {
                    inner.bands[band].push(slot);
                }
            }
        }
        drop(inner);
        if !expired.is_empty() {
            debug!(count = expired.len(), "purged expired queue entries");
            self.space.notify_one();
        }
        expired
    }

    /// Serializes pending entries for crash-recovery persistence.
    pub fn snapshot(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<QueueEntry> = inner
            .bands
            .iter()
            .flat_map(|band| band.iter())
            .filter(|slot| !inner.tombstones.contains(&slot.0.descriptor.id))
            .map(|slot| slot.0.clone())
            .collect();
        entries.sort_by_key(|e| {
            (
                e.descriptor.priority,
                e.next_eligible_ts,
                e.sequence,
            )
        });
        snapshot::encode(&entries)
    }

    /// Restores entries from a snapshot, keeping their ordering keys and
    /// continuing the sequence counter past the highest restored value.
    pub fn restore(&self, bytes: &[u8]) -> std::result::Result<usize, SnapshotError> {
        let entries = snapshot::decode(bytes)?;
        let count = entries.len();
        let mut inner = self.inner.lock().unwrap();
        for entry in entries {
            inner.next_sequence = inner.next_sequence.max(entry.sequence + 1);
            inner
                .queued
                .insert(entry.descriptor.id, entry.descriptor.partition.clone());
            if let Some(partition) = &entry.descriptor.partition {
                *inner.partition_counts.entry(partition.clone()).or_insert(0) += 1;
            }
            inner.live += 1;
            let band = entry.descriptor.priority.band();
            inner.bands[band].push(HeapSlot(entry));
        }
        drop(inner);
        self.ready.notify_waiters();
        Ok(count)
    }

    /// Caps how many entries `partition` may hold pending at once.
    pub fn set_partition_limit(&self, partition: impl Into<String>, limit: usize) {
        self.inner
            .lock()
            .unwrap()
            .partition_limits
            .insert(partition.into(), limit);
    }

    /// Pending entries admitted under `partition`.
    pub fn partition_size(&self, partition: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .partition_counts
            .get(partition)
            .copied()
            .unwrap_or(0)
    }

    /// Signals shutdown: no further enqueues; dequeue drains what remains and
    /// then reports `None`.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}
