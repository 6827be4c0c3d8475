//! # Dispatcher
//!
//! The worker pool. Each worker pulls ready entries from the queue and walks
//! one attempt through the pipeline: cache consultation (single-flight),
//! breaker admission, token acquisition, the wire call, classification, and
//! the retry/complete/dead-letter decision.
//!
//! Exactly one worker owns a descriptor between dequeue and either
//! completion or re-enqueue; an in-flight descriptor is never duplicated in
//! the queue. Workers never crash the pool: every failure is classified
//! into an outcome and recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::breaker::BreakerRegistry;
use crate::cache::{Flight, ResponseCache};
use crate::clock::{Clock, EpochNanos};
use crate::config::DispatchConfig;
use crate::descriptor::RequestId;
use crate::dlq::DeadLetterQueue;
use crate::events::{EventBus, EventKind};
use crate::outcome::{DispatchOutcome, OutcomeKind, ResponseRecord};
use crate::queue::{PriorityQueue, QueueEntry};
use crate::rate::TokenBucket;
use crate::retry::{self, AttemptSignal, RetryDecision, RetryPolicy};
use crate::transport::{Transport, TransportErrorKind};

/// Ledger of descriptors currently owned by workers, and since when.
///
/// The monitor samples it for the `inflight` gauge and for
/// `requests.oldest_inflight_age`, which backs stuck-request alerting.
#[derive(Debug, Default)]
pub struct InflightTracker {
    started: Mutex<HashMap<RequestId, EpochNanos>>,
}

impl InflightTracker {
    /// Marks `id` as owned by a worker starting at `now`.
    pub fn begin(&self, id: RequestId, now: EpochNanos) {
        self.started.lock().unwrap().insert(id, now);
    }

    /// Releases ownership of `id`.
    pub fn end(&self, id: RequestId) {
        self.started.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the longest-running in-flight request.
    pub fn oldest_age(&self, now: EpochNanos) -> Option<Duration> {
        self.started
            .lock()
            .unwrap()
            .values()
            .min()
            .map(|started| Duration::from_nanos(now.saturating_sub(*started).max(0) as u64))
    }
}

/// Everything a worker needs, shared across the pool.
pub(crate) struct Shared {
    pub config: DispatchConfig,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<PriorityQueue>,
    pub bucket: Arc<TokenBucket>,
    pub cache: Arc<ResponseCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    pub transport: Arc<dyn Transport>,
    pub events: EventBus,
    pub retry_policy: RetryPolicy,
    pub inflight: Arc<InflightTracker>,
    completions: Mutex<HashMap<RequestId, oneshot::Sender<DispatchOutcome>>>,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
        queue: Arc<PriorityQueue>,
        bucket: Arc<TokenBucket>,
        cache: Arc<ResponseCache>,
        breakers: Arc<BreakerRegistry>,
        dlq: Arc<DeadLetterQueue>,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let retry_policy = RetryPolicy::new(config.retry.clone());
        Self {
            config,
            clock,
            queue,
            bucket,
            cache,
            breakers,
            dlq,
            transport,
            events,
            retry_policy,
            inflight: Arc::new(InflightTracker::default()),
            completions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a completion slot; the handle half resolves on terminal
    /// outcome.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<DispatchOutcome> {
        let (tx, rx) = oneshot::channel();
        self.completions.lock().unwrap().insert(id, tx);
        rx
    }

    /// Resolves the handle for `id`, if still awaited.
    pub fn complete(&self, id: RequestId, outcome: DispatchOutcome) {
        if let Some(tx) = self.completions.lock().unwrap().remove(&id) {
            let _ = tx.send(outcome);
        }
    }

    /// Resolves every outstanding handle as canceled (shutdown path).
    pub fn cancel_all(&self) {
        let pending: Vec<_> = {
            let mut completions = self.completions.lock().unwrap();
            completions.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(DispatchOutcome::failed(
                OutcomeKind::Canceled,
                0,
                "dispatcher stopped",
            ));
        }
    }

}

/// Spawns the worker pool.
pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    shutdown: &watch::Sender<bool>,
) -> Vec<JoinHandle<()>> {
    (0..shared.config.max_concurrent_requests.max(1))
        .map(|worker| {
            let shared = Arc::clone(shared);
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move {
                debug!(worker, "worker started");
                worker_loop(shared, shutdown).await;
                debug!(worker, "worker exited");
            })
        })
        .collect()
}

/// Resolves when the shutdown flag flips true (or the sender is gone).
async fn shutdown_signaled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let entry = {
            let mut shutdown_wait = shutdown.clone();
            tokio::select! {
                entry = shared.queue.dequeue_ready() => match entry {
                    Some(entry) => entry,
                    None => return,
                },
                _ = shutdown_signaled(&mut shutdown_wait) => return,
            }
        };

        let id = entry.descriptor.id;
        shared.inflight.begin(id, shared.clock.now());
        process_entry(&shared, entry, &mut shutdown).await;
        shared.inflight.end(id);
    }
}

enum Cycle {
    Terminal(DispatchOutcome),
    Requeued,
}

async fn process_entry(shared: &Arc<Shared>, entry: QueueEntry, shutdown: &mut watch::Receiver<bool>) {
    let now = shared.clock.now();
    let id = entry.descriptor.id;
    let queued_for =
        Duration::from_nanos(now.saturating_sub(entry.descriptor.submitted_at).max(0) as u64);
    shared.events.emit(
        Some(id),
        EventKind::Dequeued {
            attempt: entry.attempt,
            queued_for,
        },
    );

    // Wall-clock expiry is checked at dispatch, not just by the janitor: a
    // delayed retry can cross its deadline while queued.
    if entry.expiry_ts <= now {
        let outcome = DispatchOutcome::failed(
            OutcomeKind::Expired,
            entry.attempt.saturating_sub(1),
            "entry expired before dispatch",
        );
        finalize(shared, &entry, outcome);
        return;
    }

    if !shared.config.cache.enabled {
        if let Cycle::Terminal(outcome) = attempt_cycle(shared, &entry, shutdown).await {
            finalize(shared, &entry, outcome);
        }
        return;
    }

    let key = entry.descriptor.cache_key();
    if let Some(record) = shared.cache.get(&key, now) {
        shared.events.emit(Some(id), EventKind::CacheHit);
        shared.complete(id, DispatchOutcome::Completed(record));
        return;
    }

    match shared.cache.join_or_lead(&key).await {
        Flight::Shared(outcome) => {
            // A shared success is a cache hit; a shared failure is this
            // request's own terminal failure and dead-letters normally.
            if outcome.is_success() {
                shared.events.emit(Some(id), EventKind::CacheHit);
                shared.complete(id, outcome);
            } else {
                finalize(shared, &entry, outcome);
            }
        }
        Flight::Lead(guard) => {
            shared.events.emit(Some(id), EventKind::CacheMiss);
            match attempt_cycle(shared, &entry, shutdown).await {
                Cycle::Terminal(outcome) => {
                    if let DispatchOutcome::Completed(record) = &outcome {
                        if shared.config.cache.is_cacheable_status(record.status) {
                            shared.cache.put(&key, record.clone(), shared.clock.now());
                        }
                    }
                    guard.complete(outcome.clone());
                    finalize(shared, &entry, outcome);
                }
                Cycle::Requeued => guard.abandon(),
            }
        }
    }
}

/// Steps 3–7 of the worker cycle: breaker, rate, wire, classify, decide.
async fn attempt_cycle(
    shared: &Arc<Shared>,
    entry: &QueueEntry,
    shutdown: &mut watch::Receiver<bool>,
) -> Cycle {
    let descriptor = &entry.descriptor;
    let id = descriptor.id;
    let now = shared.clock.now();

    let origin = match descriptor.origin() {
        Ok(origin) => origin,
        // Validation at submit makes this unreachable in practice; classify
        // rather than crash the worker if it ever regresses.
        Err(e) => {
            error!(%id, error = %e, "descriptor with unparseable origin reached a worker");
            return Cycle::Terminal(DispatchOutcome::failed(
                OutcomeKind::TransportError,
                entry.attempt,
                e.to_string(),
            ));
        }
    };

    let admission = match shared.breakers.admit(&origin, now) {
        Ok(admission) => admission,
        Err(()) => {
            shared.events.emit(
                Some(id),
                EventKind::BreakerRejected {
                    origin: origin.to_string(),
                },
            );
            return Cycle::Terminal(DispatchOutcome::failed(
                OutcomeKind::CircuitOpen,
                entry.attempt,
                format!("circuit open for {origin}"),
            ));
        }
    };

    // Rate acquisition races shutdown; dropping the acquire consumes nothing.
    let acquired = tokio::select! {
        _ = shared.bucket.acquire(1) => true,
        _ = shutdown_signaled(shutdown) => false,
    };
    if !acquired {
        shared.breakers.on_abandon(&admission);
        return Cycle::Terminal(DispatchOutcome::failed(
            OutcomeKind::Canceled,
            entry.attempt,
            "shutdown before dispatch",
        ));
    }

    shared.events.emit(
        Some(id),
        EventKind::Attempted {
            attempt: entry.attempt,
        },
    );

    let attempt_start = std::time::Instant::now();
    let sent = tokio::time::timeout(
        descriptor.timeout,
        shared.transport.send(descriptor, descriptor.timeout),
    )
    .await;
    let attempt_elapsed = attempt_start.elapsed();
    let now = shared.clock.now();

    // Classify the attempt and update the breaker: transport errors,
    // timeouts and 5xx count against the origin; anything else clears it.
    let (signal, kind, detail) = match sent {
        Err(_) => {
            shared.breakers.on_failure(&admission, now);
            (
                AttemptSignal::Timeout,
                OutcomeKind::Timeout,
                format!("attempt exceeded {:?}", descriptor.timeout),
            )
        }
        Ok(Err(failure)) => {
            shared.breakers.on_failure(&admission, now);
            let (signal, kind) = match failure.kind {
                TransportErrorKind::Timeout => (AttemptSignal::Timeout, OutcomeKind::Timeout),
                TransportErrorKind::Canceled => {
                    (AttemptSignal::TransportError, OutcomeKind::Canceled)
                }
                _ => (AttemptSignal::TransportError, OutcomeKind::TransportError),
            };
            (signal, kind, failure.message)
        }
        Ok(Ok(response)) => {
            if response.status >= 500 {
                shared.breakers.on_failure(&admission, now);
            } else {
                shared.breakers.on_success(&admission);
            }

            if shared.config.is_success_status(response.status) {
                let record = ResponseRecord {
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    attempts: entry.attempt,
                    total_time: Duration::from_nanos(
                        now.saturating_sub(descriptor.submitted_at).max(0) as u64,
                    ),
                    cache_hit: false,
                    outcome: OutcomeKind::Success,
                };
                shared.events.emit(
                    Some(id),
                    EventKind::Succeeded {
                        status: record.status,
                        attempts: entry.attempt,
                        duration: attempt_elapsed,
                    },
                );
                return Cycle::Terminal(DispatchOutcome::Completed(record));
            }

            let retry_after = response
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
                .and_then(|(_, v)| retry::parse_retry_after(v, now));
            let kind = if response.status == 429 {
                OutcomeKind::RateLimited
            } else {
                OutcomeKind::HttpError
            };
            (
                AttemptSignal::Response {
                    status: response.status,
                    retry_after,
                },
                kind,
                format!("http status {}", response.status),
            )
        }
    };

    // Shutdown skips retries: the current attempt's classification stands.
    if !*shutdown.borrow() && kind != OutcomeKind::Canceled {
        if let RetryDecision::Retry { delay } =
            shared
                .retry_policy
                .decide(&descriptor.retry, entry.attempt, &signal)
        {
            let next_attempt = entry.attempt + 1;
            let eligible = shared.clock.now() + crate::clock::nanos(delay);
            match shared.queue.enqueue(
                descriptor.clone(),
                next_attempt,
                eligible,
                entry.expiry_ts,
            ) {
                Ok(_) => {
                    shared.events.emit(
                        Some(id),
                        EventKind::RetryScheduled {
                            attempt: next_attempt,
                            delay,
                        },
                    );
                    return Cycle::Requeued;
                }
                Err(e) => {
                    return Cycle::Terminal(DispatchOutcome::failed(
                        kind,
                        entry.attempt,
                        format!("{detail}; retry refused: {e}"),
                    ));
                }
            }
        }
    }

    Cycle::Terminal(DispatchOutcome::failed(kind, entry.attempt, detail))
}

/// Records a terminal outcome: events, dead-letter routing, handle resolution.
pub(crate) fn finalize(shared: &Arc<Shared>, entry: &QueueEntry, outcome: DispatchOutcome) {
    let id = entry.descriptor.id;
    if let DispatchOutcome::Failed {
        kind,
        attempts,
        detail,
    } = &outcome
    {
        shared.events.emit(
            Some(id),
            EventKind::Failed {
                outcome: *kind,
                attempts: *attempts,
                detail: detail.clone(),
            },
        );
        shared
            .dlq
            .push(entry.descriptor.clone(), *kind, *attempts, detail.clone());
        shared
            .events
            .emit(Some(id), EventKind::DeadLettered { outcome: *kind });
    }
    shared.complete(id, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ConfigBuilder;
    use crate::descriptor::{Priority, RequestDescriptor};
    use crate::events;
    use crate::transport::MockTransport;

    fn shared_with(
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
    ) -> (Arc<Shared>, watch::Sender<bool>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (bus, _rx) = events::channel();
        let queue = Arc::new(PriorityQueue::new(config.queue.max_size, clock.clone()));
        let bucket = Arc::new(TokenBucket::new(
            config.rate_limit.per_second,
            config.rate_limit.burst,
            clock.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(config.queue.dlq_max_size));
        let shared = Arc::new(Shared::new(
            config, clock, queue, bucket, cache, breakers, dlq, transport, bus,
        ));
        let (tx, _) = watch::channel(false);
        (shared, tx)
    }

    fn entry_for(shared: &Arc<Shared>, url: &str) -> QueueEntry {
        let mut descriptor = RequestDescriptor::get(url)
            .priority(Priority::Normal)
            .build()
            .unwrap();
        descriptor.submitted_at = shared.clock.now();
        QueueEntry {
            descriptor,
            sequence: 0,
            attempt: 1,
            next_eligible_ts: shared.clock.now(),
            expiry_ts: shared.clock.now() + i64::MAX / 2,
        }
    }

    #[tokio::test]
    async fn test_inflight_tracker_ages() {
        let tracker = InflightTracker::default();
        assert!(tracker.is_empty());
        assert_eq!(tracker.oldest_age(1_000), None);

        let young = RequestId::new();
        let old = RequestId::new();
        tracker.begin(old, 1_000);
        tracker.begin(young, 5_000);
        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.oldest_age(6_000),
            Some(Duration::from_nanos(5_000))
        );

        tracker.end(old);
        assert_eq!(
            tracker.oldest_age(6_000),
            Some(Duration::from_nanos(1_000))
        );
        tracker.end(young);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_success_produces_completed_record() {
        let transport = Arc::new(MockTransport::always(200));
        let config = ConfigBuilder::new().cache_enabled(false).build();
        let (shared, shutdown) = shared_with(transport.clone(), config);
        let entry = entry_for(&shared, "https://h.example.com/ok");
        let mut rx = shutdown.subscribe();

        match attempt_cycle(&shared, &entry, &mut rx).await {
            Cycle::Terminal(DispatchOutcome::Completed(record)) => {
                assert_eq!(record.status, 200);
                assert_eq!(record.attempts, 1);
                assert!(!record.cache_hit);
            }
            _ => panic!("expected completion"),
        }
        assert_eq!(transport.sent(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_with_bumped_attempt() {
        let transport = Arc::new(MockTransport::always(503));
        let config = ConfigBuilder::new().cache_enabled(false).build();
        let (shared, shutdown) = shared_with(transport, config);
        let entry = entry_for(&shared, "https://h.example.com/flaky");
        let mut rx = shutdown.subscribe();

        match attempt_cycle(&shared, &entry, &mut rx).await {
            Cycle::Requeued => {}
            Cycle::Terminal(_) => panic!("503 on attempt 1 must requeue"),
        }
        assert_eq!(shared.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_status_is_terminal() {
        let transport = Arc::new(MockTransport::always(404));
        let config = ConfigBuilder::new().cache_enabled(false).build();
        let (shared, shutdown) = shared_with(transport, config);
        let entry = entry_for(&shared, "https://h.example.com/missing");
        let mut rx = shutdown.subscribe();

        match attempt_cycle(&shared, &entry, &mut rx).await {
            Cycle::Terminal(outcome) => {
                assert_eq!(outcome.kind(), OutcomeKind::HttpError);
                assert_eq!(outcome.attempts(), 1);
            }
            Cycle::Requeued => panic!("404 must not retry"),
        }
        assert!(shared.queue.is_empty());
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_wire_call() {
        let transport = Arc::new(MockTransport::always(500));
        let config = ConfigBuilder::new()
            .cache_enabled(false)
            .breaker_failure_threshold(1)
            .build();
        let (shared, shutdown) = shared_with(transport.clone(), config);
        let mut rx = shutdown.subscribe();

        // First request opens the breaker (500 is a breaker failure but not
        // retryable).
        let first = entry_for(&shared, "https://down.example.com/a");
        match attempt_cycle(&shared, &first, &mut rx).await {
            Cycle::Terminal(outcome) => assert_eq!(outcome.kind(), OutcomeKind::HttpError),
            Cycle::Requeued => panic!("500 must not retry"),
        }
        let wire_calls = transport.sent();

        let second = entry_for(&shared, "https://down.example.com/b");
        match attempt_cycle(&shared, &second, &mut rx).await {
            Cycle::Terminal(outcome) => assert_eq!(outcome.kind(), OutcomeKind::CircuitOpen),
            Cycle::Requeued => panic!("circuit-open is terminal"),
        }
        assert_eq!(transport.sent(), wire_calls, "no wire call through an open circuit");
    }

    #[tokio::test]
    async fn test_expired_entry_dead_letters() {
        let transport = Arc::new(MockTransport::always(200));
        let config = ConfigBuilder::new().cache_enabled(false).build();
        let (shared, shutdown) = shared_with(transport.clone(), config);
        let mut entry = entry_for(&shared, "https://h.example.com/late");
        entry.expiry_ts = shared.clock.now() - 1;
        let mut rx = shutdown.subscribe();

        process_entry(&shared, entry, &mut rx).await;
        assert_eq!(shared.dlq.len(), 1);
        assert_eq!(shared.dlq.entries()[0].outcome, OutcomeKind::Expired);
        assert_eq!(transport.sent(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_skips_retries() {
        let transport = Arc::new(MockTransport::always(503));
        let config = ConfigBuilder::new().cache_enabled(false).build();
        let (shared, shutdown) = shared_with(transport, config);
        let entry = entry_for(&shared, "https://h.example.com/x");
        let mut rx = shutdown.subscribe();

        shutdown.send(true).unwrap();
        match attempt_cycle(&shared, &entry, &mut rx).await {
            Cycle::Terminal(outcome) => {
                // Either the attempt ran and its classification stands, or the
                // rate acquire lost the race; both must be terminal.
                assert!(matches!(
                    outcome.kind(),
                    OutcomeKind::HttpError | OutcomeKind::Canceled
                ));
            }
            Cycle::Requeued => panic!("no retries during shutdown"),
        }
        assert!(shared.queue.is_empty());
    }
}
