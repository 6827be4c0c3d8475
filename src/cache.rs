//! # Response Cache
//!
//! TTL-bounded memoization of responses keyed by `method|url|body-hash`,
//! with LRU eviction at capacity and single-flight coalescing: concurrent
//! workers holding the same key rendezvous so that at most one of them goes
//! to the wire while the rest await its result.
//!
//! The flight mechanism is a per-key [`watch`] channel. The first caller
//! becomes the leader and receives a [`FlightGuard`]; followers subscribe
//! and block on the channel. The leader either *completes* the flight with a
//! terminal outcome (stored when the status is cacheable) or *abandons* it
//! (its attempt was re-enqueued for retry), which wakes followers to contend
//! for leadership themselves. Dropping the guard abandons, so a cancelled
//! leader can never strand its followers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::clock::{nanos, EpochNanos};
use crate::config::CacheConfig;
use crate::outcome::{DispatchOutcome, ResponseRecord};

#[derive(Debug, Clone)]
struct StoredEntry {
    record: ResponseRecord,
    stored_at: EpochNanos,
    ttl: Duration,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<String, StoredEntry>,
    access_stamp: u64,
}

#[derive(Debug, Clone)]
enum FlightState {
    Pending,
    /// `None` means the leader abandoned (retry scheduled) and followers
    /// should contend again.
    Done(Option<DispatchOutcome>),
}

type FlightMap = Arc<Mutex<HashMap<String, watch::Sender<FlightState>>>>;

/// Result of [`ResponseCache::join_or_lead`].
pub enum Flight {
    /// Another worker owned the flight; its terminal outcome, marked as a
    /// cache hit.
    Shared(DispatchOutcome),
    /// The caller is the leader and must resolve the guard.
    Lead(FlightGuard),
}

/// Leadership over one in-flight cache key.
pub struct FlightGuard {
    flights: FlightMap,
    key: String,
    tx: watch::Sender<FlightState>,
    resolved: bool,
}

impl FlightGuard {
    /// Resolves the flight with a terminal outcome, sharing it with
    /// followers. The caller is responsible for having stored the record via
    /// [`ResponseCache::put`] when appropriate.
    pub fn complete(mut self, outcome: DispatchOutcome) {
        self.finish(Some(outcome));
    }

    /// Releases the flight without a result; followers re-contend.
    pub fn abandon(mut self) {
        self.finish(None);
    }

    fn finish(&mut self, result: Option<DispatchOutcome>) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.flights.lock().unwrap().remove(&self.key);
        let _ = self.tx.send(FlightState::Done(result));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.finish(None);
    }
}

/// TTL + LRU response cache with single-flight coalescing.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    flights: FlightMap,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fresh-entry lookup. Expired entries are discarded on read. Reads never
    /// block beyond the lock.
    pub fn get(&self, key: &str, now: EpochNanos) -> Option<ResponseRecord> {
        let mut inner = self.inner.lock().unwrap();
        let fresh = match inner.map.get(key) {
            Some(entry) => now.saturating_sub(entry.stored_at) < nanos(entry.ttl),
            None => return None,
        };
        if !fresh {
            inner.map.remove(key);
            return None;
        }
        inner.access_stamp += 1;
        let stamp = inner.access_stamp;
        inner.map.get_mut(key).map(|entry| {
            entry.last_access = stamp;
            entry.record.as_cache_hit()
        })
    }

    /// Inserts or overwrites, evicting least-recently-used entries beyond
    /// capacity.
    pub fn put(&self, key: impl Into<String>, record: ResponseRecord, now: EpochNanos) {
        let mut inner = self.inner.lock().unwrap();
        inner.access_stamp += 1;
        let stamp = inner.access_stamp;
        inner.map.insert(
            key.into(),
            StoredEntry {
                record,
                stored_at: now,
                ttl: self.config.ttl,
                last_access: stamp,
            },
        );

        while inner.map.len() > self.config.max_entries {
            let coldest = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match coldest {
                Some(key) => inner.map.remove(&key),
                None => break,
            };
        }
    }

    /// Joins the in-flight computation for `key`, or becomes its leader.
    ///
    /// Suspends only while following; leadership is granted synchronously
    /// under the flight lock.
    pub async fn join_or_lead(&self, key: &str) -> Flight {
        loop {
            let mut rx = {
                let mut flights = self.flights.lock().unwrap();
                match flights.get(key) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, _rx) = watch::channel(FlightState::Pending);
                        flights.insert(key.to_string(), tx.clone());
                        return Flight::Lead(FlightGuard {
                            flights: Arc::clone(&self.flights),
                            key: key.to_string(),
                            tx,
                            resolved: false,
                        });
                    }
                }
            };

            let shared = loop {
                if let FlightState::Done(result) = &*rx.borrow() {
                    break result.clone();
                }
                if rx.changed().await.is_err() {
                    // Leader dropped without resolving; treat as abandoned.
                    break None;
                }
            };

            match shared {
                Some(outcome) => {
                    let outcome = match outcome {
                        DispatchOutcome::Completed(record) => {
                            DispatchOutcome::Completed(record.as_cache_hit())
                        }
                        failed => failed,
                    };
                    return Flight::Shared(outcome);
                }
                // Abandoned: contend again.
                None => continue,
            }
        }
    }

    /// Drops entries whose TTL elapsed; returns how many were removed.
    pub fn purge_expired(&self, now: EpochNanos) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.map.len();
        inner
            .map
            .retain(|_, e| now.saturating_sub(e.stored_at) < nanos(e.ttl));
        before - inner.map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
