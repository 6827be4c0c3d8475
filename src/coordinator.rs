//! # Coordinator
//!
//! Owns the engine: builds and wires the queue, rate limiter, cache,
//! breakers, dead-letter queue and monitor; runs the worker pool and the
//! janitor; and exposes the external surface: `submit`, `cancel`,
//! `status`, `start`/`stop`.
//!
//! There is no process-wide state: every collaborator receives its handles
//! at construction, and dropping the coordinator drops the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::cache::ResponseCache;
use crate::clock::{nanos, Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::descriptor::{Priority, RequestDescriptor, RequestId};
use crate::dispatcher::{self, Shared};
use crate::dlq::{DeadLetter, DeadLetterQueue};
use crate::error::{DispatchError, Result};
use crate::events::{self, DispatchEvent, EventKind};
use crate::metrics::MetricCollector;
use crate::monitor::{AlertSink, GaugeSources, Health, Monitor, ThresholdRule};
use crate::outcome::{DispatchOutcome, OutcomeKind};
use crate::queue::PriorityQueue;
use crate::rate::TokenBucket;
use crate::transport::Transport;

/// Resolves with the terminal outcome of one submitted request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    rx: oneshot::Receiver<DispatchOutcome>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Awaits the terminal outcome. A dispatcher that stopped before
    /// resolving reports `Canceled`.
    pub async fn outcome(self) -> DispatchOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => DispatchOutcome::failed(OutcomeKind::Canceled, 0, "dispatcher dropped"),
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub running: bool,
    pub queue_size: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub breaker_states: HashMap<String, BreakerSnapshot>,
    pub health: Health,
    pub dlq_size: usize,
    pub cache_entries: usize,
}

enum RunState {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    workers: Vec<JoinHandle<()>>,
    monitor: JoinHandle<()>,
    janitor: JoinHandle<()>,
}

/// The dispatch engine's lifecycle owner and API surface.
pub struct Coordinator {
    shared: Arc<Shared>,
    monitor: Arc<Monitor>,
    shutdown: watch::Sender<bool>,
    state: Mutex<RunState>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DispatchEvent>>>,
}

impl Coordinator {
    /// Builds an engine with the system clock.
    pub fn new(config: DispatchConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Builds an engine with an injected clock (tests).
    pub fn with_clock(
        config: DispatchConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (bus, events_rx) = events::channel();
        let queue = Arc::new(PriorityQueue::new(config.queue.max_size, clock.clone()));
        let bucket = Arc::new(TokenBucket::new(
            config.rate_limit.per_second,
            config.rate_limit.burst,
            clock.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(config.queue.dlq_max_size));
        let monitor = Arc::new(Monitor::new(config.monitor.clone(), bus.clone()));

        let shared = Arc::new(Shared::new(
            config,
            clock,
            queue,
            bucket,
            cache,
            breakers,
            dlq,
            transport,
            bus,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            shared,
            monitor,
            shutdown,
            state: Mutex::new(RunState::Idle),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Starts workers, monitor and janitor. Restores a queue snapshot when
    /// persistence is configured; a corrupted snapshot is renamed aside and
    /// startup proceeds with an empty queue.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            RunState::Idle => {}
            RunState::Running(_) => {
                return Err(DispatchError::Lifecycle {
                    message: "already running".to_string(),
                })
            }
            RunState::Stopped => {
                return Err(DispatchError::Lifecycle {
                    message: "stopped coordinators do not restart; build a new one".to_string(),
                })
            }
        }

        if let Some(path) = self.shared.config.queue.persist_path.clone() {
            self.restore_snapshot(&path);
        }

        let workers = dispatcher::spawn_workers(&self.shared, &self.shutdown);

        let events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DispatchError::Lifecycle {
                message: "event stream already consumed".to_string(),
            })?;
        let sources = GaugeSources {
            queue: Arc::clone(&self.shared.queue),
            dlq: Arc::clone(&self.shared.dlq),
            breakers: Arc::clone(&self.shared.breakers),
            inflight: Arc::clone(&self.shared.inflight),
            clock: Arc::clone(&self.shared.clock),
        };
        let monitor = tokio::spawn(Arc::clone(&self.monitor).run(
            events_rx,
            self.shutdown.subscribe(),
            sources,
        ));

        let janitor = tokio::spawn(janitor_loop(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
        ));

        *state = RunState::Running(Running {
            workers,
            monitor,
            janitor,
        });
        info!(
            workers = self.shared.config.max_concurrent_requests,
            "dispatcher started"
        );
        Ok(())
    }

    /// Signals shutdown, waits up to `grace` for workers to finish their
    /// current attempts, aborts stragglers, and snapshots the queue when
    /// persistence is configured.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let mut running = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, RunState::Stopped) {
                RunState::Running(running) => running,
                other => {
                    *state = other;
                    return Err(DispatchError::Lifecycle {
                        message: "not running".to_string(),
                    });
                }
            }
        };

        info!(grace = ?grace, "stopping dispatcher");
        let _ = self.shutdown.send(true);
        self.shared.queue.close();

        // Workers check the shutdown flag between entries and skip retries,
        // so the common case drains well inside the grace window; stragglers
        // are aborted once it elapses.
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0usize;
        for handle in running.workers.iter_mut() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut *handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "grace elapsed; aborted remaining workers");
        }

        running.janitor.abort();
        let _ = tokio::time::timeout(Duration::from_secs(1), running.monitor).await;

        if let Some(path) = self.shared.config.queue.persist_path.clone() {
            self.write_snapshot(&path);
        }

        self.shared.cancel_all();
        info!("dispatcher stopped");
        Ok(())
    }

    /// Submits one request at the given priority; fails fast with
    /// `QueueFull` at capacity.
    pub fn submit(
        &self,
        descriptor: RequestDescriptor,
        priority: Priority,
    ) -> Result<RequestHandle> {
        self.submit_inner(descriptor, priority)
    }

    /// Like [`submit`](Self::submit), but awaits queue capacity instead of
    /// failing fast.
    pub async fn submit_blocking(
        &self,
        mut descriptor: RequestDescriptor,
        priority: Priority,
    ) -> Result<RequestHandle> {
        self.ensure_running()?;
        descriptor.priority = priority;
        descriptor.submitted_at = self.shared.clock.now();
        descriptor.validate()?;

        let id = descriptor.id;
        let rx = self.shared.register(id);
        let now = descriptor.submitted_at;
        let expiry = now + nanos(self.shared.config.queue.item_ttl);
        let enqueued = self
            .shared
            .queue
            .enqueue_wait(descriptor.clone(), 1, now, expiry)
            .await;
        self.after_enqueue(descriptor, id, enqueued)?;
        Ok(RequestHandle { id, rx })
    }

    /// Submits a batch at one priority, failing the whole batch on the first
    /// refused descriptor.
    pub fn submit_batch(
        &self,
        descriptors: Vec<RequestDescriptor>,
        priority: Priority,
    ) -> Result<Vec<RequestHandle>> {
        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            handles.push(self.submit(descriptor, priority)?);
        }
        Ok(handles)
    }

    /// Removes a still-queued request. Returns `false` once it has been
    /// dispatched; in-flight cancellation is best-effort via the attempt's
    /// own deadline.
    pub fn cancel(&self, id: RequestId) -> bool {
        if self.shared.queue.remove(id) {
            self.shared.complete(
                id,
                DispatchOutcome::failed(OutcomeKind::Canceled, 0, "canceled by caller"),
            );
            true
        } else {
            false
        }
    }

    pub fn status(&self) -> Status {
        let running = matches!(*self.state.lock().unwrap(), RunState::Running(_));
        Status {
            running,
            queue_size: self.shared.queue.len(),
            in_flight: self.shared.inflight.len(),
            workers: self.shared.config.max_concurrent_requests,
            breaker_states: self.shared.breakers.snapshot(),
            health: self.monitor.health(),
            dlq_size: self.shared.dlq.len(),
            cache_entries: self.shared.cache.len(),
        }
    }

    /// The retained dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dlq.entries()
    }

    /// Re-submits the dead letter at `index` (as reported by
    /// [`dead_letters`](Self::dead_letters)) as a fresh attempt under its
    /// original priority. The letter is removed from the dead-letter queue;
    /// a refused re-submission puts it back.
    pub fn replay_dead_letter(&self, index: usize) -> Result<RequestHandle> {
        let letter = self
            .shared
            .dlq
            .take(index)
            .ok_or_else(|| DispatchError::Other(format!("no dead letter at index {index}")))?;
        let priority = letter.descriptor.priority;
        match self.submit_inner(letter.descriptor.clone(), priority) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.shared.dlq.reinsert(letter);
                Err(e)
            }
        }
    }

    /// Caps how many pending entries `partition` may hold.
    pub fn set_partition_limit(&self, partition: impl Into<String>, limit: usize) {
        self.shared.queue.set_partition_limit(partition, limit);
    }

    /// Pending entries admitted under `partition`.
    pub fn partition_size(&self, partition: &str) -> usize {
        self.shared.queue.partition_size(partition)
    }

    pub fn health(&self) -> Health {
        self.monitor.health()
    }

    pub fn metrics(&self) -> Arc<MetricCollector> {
        Arc::clone(self.monitor.metrics())
    }

    /// Registers an alert threshold at runtime.
    pub fn add_threshold(&self, rule: ThresholdRule) {
        self.monitor.add_threshold(rule);
    }

    /// Registers an alert delivery sink.
    pub fn add_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        self.monitor.add_sink(sink);
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.state.lock().unwrap() {
            RunState::Running(_) => Ok(()),
            _ => Err(DispatchError::Lifecycle {
                message: "coordinator is not running".to_string(),
            }),
        }
    }

    fn submit_inner(
        &self,
        mut descriptor: RequestDescriptor,
        priority: Priority,
    ) -> Result<RequestHandle> {
        self.ensure_running()?;
        descriptor.priority = priority;
        descriptor.submitted_at = self.shared.clock.now();
        descriptor.validate()?;

        let id = descriptor.id;
        let rx = self.shared.register(id);
        let now = descriptor.submitted_at;
        let expiry = now + nanos(self.shared.config.queue.item_ttl);
        let enqueued = self.shared.queue.enqueue(descriptor.clone(), 1, now, expiry);
        self.after_enqueue(descriptor, id, enqueued)?;
        Ok(RequestHandle { id, rx })
    }

    fn after_enqueue(
        &self,
        descriptor: RequestDescriptor,
        id: RequestId,
        enqueued: Result<u64>,
    ) -> Result<()> {
        match enqueued {
            Ok(_) => {
                self.shared.events.emit(
                    Some(id),
                    EventKind::Submitted {
                        priority: descriptor.priority,
                        url: descriptor.url,
                    },
                );
                Ok(())
            }
            Err(e) => {
                // Roll back the completion slot so the map cannot leak.
                let kind = match &e {
                    DispatchError::QueueFull { .. } | DispatchError::PartitionFull { .. } => {
                        OutcomeKind::QueueFull
                    }
                    _ => OutcomeKind::Canceled,
                };
                self.shared
                    .complete(id, DispatchOutcome::failed(kind, 0, e.to_string()));
                Err(e)
            }
        }
    }

    fn restore_snapshot(&self, path: &std::path::Path) {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read queue snapshot");
                return;
            }
        };
        match self.shared.queue.restore(&bytes) {
            Ok(count) => info!(count, path = %path.display(), "restored queue snapshot"),
            Err(e) => {
                let quarantine = path.with_extension("corrupt");
                error!(
                    path = %path.display(),
                    error = %e,
                    quarantine = %quarantine.display(),
                    "corrupted queue snapshot; starting empty"
                );
                if let Err(rename_err) = std::fs::rename(path, &quarantine) {
                    warn!(error = %rename_err, "could not quarantine corrupted snapshot");
                }
            }
        }
    }

    fn write_snapshot(&self, path: &std::path::Path) {
        let bytes = self.shared.queue.snapshot();
        let tmp = path.with_extension("tmp");
        let result = std::fs::write(&tmp, &bytes).and_then(|()| std::fs::rename(&tmp, path));
        match result {
            Ok(()) => info!(
                path = %path.display(),
                entries = self.shared.queue.len(),
                "queue snapshot written"
            ),
            // In-memory state stays inspectable; only persistence is lost.
            Err(e) => error!(path = %path.display(), error = %e, "queue snapshot failed"),
        }
    }
}

/// Awaits a batch of handles, preserving submission order.
pub async fn join_all(handles: Vec<RequestHandle>) -> Vec<DispatchOutcome> {
    futures::future::join_all(handles.into_iter().map(RequestHandle::outcome)).await
}

/// Background sweeper: routes expired queue entries to the dead-letter queue
/// and drops expired cache entries.
async fn janitor_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = (shared.config.queue.item_ttl / 10)
        .clamp(Duration::from_millis(100), Duration::from_secs(30));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = shared.clock.now();
                for entry in shared.queue.purge_expired(now) {
                    let outcome = DispatchOutcome::failed(
                        OutcomeKind::Expired,
                        entry.attempt.saturating_sub(1),
                        "entry expired in queue",
                    );
                    dispatcher::finalize(&shared, &entry, outcome);
                }
                shared.cache.purge_expired(now);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::descriptor::Method;
    use crate::transport::{MockTransport, Scripted};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dispatchq-{}-{}", name, uuid::Uuid::new_v4()))
    }

    fn quick_config() -> DispatchConfig {
        ConfigBuilder::new()
            .workers(2)
            .rate_limit(10_000)
            .collect_interval(Duration::from_millis(20))
            .build()
    }

    #[tokio::test]
    async fn test_submit_resolves_with_response() {
        let coordinator = Coordinator::new(quick_config(), Arc::new(MockTransport::always(200)));
        coordinator.start().unwrap();

        let handle = coordinator
            .submit(
                RequestDescriptor::get("https://api.example.com/ok").build().unwrap(),
                Priority::Normal,
            )
            .unwrap();
        let outcome = handle.outcome().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.record().unwrap().status, 200);

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_requires_running() {
        let coordinator = Coordinator::new(quick_config(), Arc::new(MockTransport::always(200)));
        let err = coordinator
            .submit(
                RequestDescriptor::get("https://api.example.com/").build().unwrap(),
                Priority::Normal,
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Lifecycle { .. }));
    }

    #[tokio::test]
    async fn test_double_start_refused() {
        let coordinator = Coordinator::new(quick_config(), Arc::new(MockTransport::always(200)));
        coordinator.start().unwrap();
        assert!(coordinator.start().is_err());
        coordinator.stop(Duration::from_secs(1)).await.unwrap();
        assert!(coordinator.start().is_err());
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let config = ConfigBuilder::new().workers(1).queue_size(1).build();
        // A transport slow enough that the single worker stays busy.
        let transport =
            Arc::new(MockTransport::always(200).with_latency(Duration::from_millis(300)));
        let coordinator = Coordinator::new(config, transport);
        coordinator.start().unwrap();

        // First fills the worker, second fills the queue, third is refused.
        let _a = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/1").build().unwrap(),
                Priority::Normal,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _b = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/2").build().unwrap(),
                Priority::Normal,
            )
            .unwrap();
        let refused = coordinator.submit(
            RequestDescriptor::get("https://h.example.com/3").build().unwrap(),
            Priority::Normal,
        );
        assert!(matches!(refused, Err(DispatchError::QueueFull { .. })));

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let config = ConfigBuilder::new().workers(1).build();
        let transport =
            Arc::new(MockTransport::always(200).with_latency(Duration::from_millis(200)));
        let coordinator = Coordinator::new(config, transport);
        coordinator.start().unwrap();

        let _busy = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/busy").build().unwrap(),
                Priority::Normal,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queued = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/queued").build().unwrap(),
                Priority::Normal,
            )
            .unwrap();
        let id = queued.id();

        assert!(coordinator.cancel(id));
        assert!(!coordinator.cancel(id));
        let outcome = queued.outcome().await;
        assert_eq!(outcome.kind(), OutcomeKind::Canceled);

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reflects_engine() {
        let coordinator = Coordinator::new(quick_config(), Arc::new(MockTransport::always(200)));
        coordinator.start().unwrap();

        let status = coordinator.status();
        assert!(status.running);
        assert_eq!(status.workers, 2);
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.health, Health::Healthy);

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!coordinator.status().running);
    }

    #[tokio::test]
    async fn test_batch_submission() {
        let coordinator = Coordinator::new(quick_config(), Arc::new(MockTransport::always(200)));
        coordinator.start().unwrap();

        let descriptors: Vec<_> = (0..5)
            .map(|i| {
                RequestDescriptor::builder(Method::Get, format!("https://h.example.com/{i}"))
                    .build()
                    .unwrap()
            })
            .collect();
        let handles = coordinator.submit_batch(descriptors, Priority::High).unwrap();
        assert_eq!(handles.len(), 5);

        let outcomes = join_all(handles).await;
        assert!(outcomes.iter().all(DispatchOutcome::is_success));

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_persists_and_restores() {
        let path = temp_path("snapshot");
        let config = ConfigBuilder::new()
            .workers(1)
            .persist_path(&path)
            .build();

        // Stop with work still queued: the slow transport keeps the single
        // worker busy while two more requests wait.
        let transport =
            Arc::new(MockTransport::always(200).with_latency(Duration::from_millis(400)));
        let coordinator = Coordinator::new(config.clone(), transport);
        coordinator.start().unwrap();
        for i in 0..3 {
            coordinator
                .submit(
                    RequestDescriptor::get(format!("https://h.example.com/{i}"))
                        .build()
                        .unwrap(),
                    Priority::Normal,
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.stop(Duration::from_millis(50)).await.unwrap();

        assert!(path.exists());

        // A fresh engine picks the snapshot up and completes the work.
        let transport = Arc::new(MockTransport::always(200));
        let restored = Coordinator::new(config, transport.clone());
        restored.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(transport.sent() >= 2, "restored entries must dispatch");
        restored.stop(Duration::from_secs(1)).await.unwrap();

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_quarantined() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"not a snapshot").unwrap();

        let config = ConfigBuilder::new().persist_path(&path).build();
        let coordinator = Coordinator::new(config, Arc::new(MockTransport::always(200)));
        coordinator.start().unwrap();

        assert!(!path.exists(), "corrupted file renamed aside");
        assert!(path.with_extension("corrupt").exists());
        assert_eq!(coordinator.status().queue_size, 0);

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
        let _ = std::fs::remove_file(path.with_extension("corrupt"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_replay_dead_letter_resubmits() {
        let config = ConfigBuilder::new().workers(1).build();
        // First pass fails with a 500; the replay finds the origin healthy.
        let transport = Arc::new(MockTransport::sequence(vec![
            Scripted::Status(500),
            Scripted::Status(200),
        ]));
        let coordinator = Coordinator::new(config, transport);
        coordinator.start().unwrap();

        let handle = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/retry-me")
                    .priority(Priority::High)
                    .build()
                    .unwrap(),
                Priority::High,
            )
            .unwrap();
        assert_eq!(handle.outcome().await.kind(), OutcomeKind::HttpError);
        assert_eq!(coordinator.dead_letters().len(), 1);

        let replayed = coordinator.replay_dead_letter(0).unwrap();
        let outcome = replayed.outcome().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 1, "replay starts a fresh attempt count");
        assert!(coordinator.dead_letters().is_empty());

        assert!(coordinator.replay_dead_letter(0).is_err());

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_partition_limit_rejects_submission() {
        let config = ConfigBuilder::new().workers(1).build();
        let transport =
            Arc::new(MockTransport::always(200).with_latency(Duration::from_millis(300)));
        let coordinator = Coordinator::new(config, transport);
        coordinator.start().unwrap();
        coordinator.set_partition_limit("bulk", 1);

        // The worker grabs the first request; the second occupies the
        // partition's only pending slot.
        let _inflight = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/a")
                    .partition("bulk")
                    .build()
                    .unwrap(),
                Priority::Normal,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _pending = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/b")
                    .partition("bulk")
                    .build()
                    .unwrap(),
                Priority::Normal,
            )
            .unwrap();
        assert_eq!(coordinator.partition_size("bulk"), 1);

        let refused = coordinator.submit(
            RequestDescriptor::get("https://h.example.com/c")
                .partition("bulk")
                .build()
                .unwrap(),
            Priority::Normal,
        );
        assert!(matches!(refused, Err(DispatchError::PartitionFull { .. })));

        // Other partitions are unaffected.
        coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/d")
                    .partition("probes")
                    .build()
                    .unwrap(),
                Priority::Normal,
            )
            .unwrap();

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_requests_appear_in_dead_letters() {
        let config = ConfigBuilder::new().workers(1).max_retries(0).build();
        let transport = Arc::new(MockTransport::sequence(vec![Scripted::Status(500)]));
        let coordinator = Coordinator::new(config, transport);
        coordinator.start().unwrap();

        let handle = coordinator
            .submit(
                RequestDescriptor::get("https://h.example.com/boom").build().unwrap(),
                Priority::Normal,
            )
            .unwrap();
        let outcome = handle.outcome().await;
        assert_eq!(outcome.kind(), OutcomeKind::HttpError);

        let letters = coordinator.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].outcome, OutcomeKind::HttpError);

        coordinator.stop(Duration::from_secs(1)).await.unwrap();
    }
}
