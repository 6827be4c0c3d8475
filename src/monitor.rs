//! # Monitoring Side-Channel
//!
//! Consumes the dispatch event stream, aggregates it into the metric
//! collector, samples gauges from the live components, and evaluates
//! user-registered thresholds into firing/resolved [`Alert`]s. Health is a
//! scalar derived from the active alert set.
//!
//! A built-in rule watches the in-flight ledger: when the longest-running
//! request's age crosses `stuck_after`, a HIGH stuck-request alert fires and
//! resolves once the request completes.
//!
//! Alert delivery goes through pluggable [`AlertSink`]s. A sink is given a
//! bounded slice of the monitor's time: failures are logged and suppressed,
//! slow sinks are cut off by a timeout, and neither ever stalls collection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::dispatcher::InflightTracker;
use crate::dlq::DeadLetterQueue;
use crate::events::{DispatchEvent, EventBus, EventKind};
use crate::metrics::MetricCollector;
use crate::queue::PriorityQueue;

const SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Alert severity, ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Threshold comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Comparator {
    fn crossed(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => observed > threshold,
            Comparator::Ge => observed >= threshold,
            Comparator::Lt => observed < threshold,
            Comparator::Le => observed <= threshold,
            Comparator::Eq => (observed - threshold).abs() < f64::EPSILON,
        }
    }
}

/// A user-registered alerting rule. `metric` names a counter, a gauge, or a
/// histogram summary stat (`request.duration.p95`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,
    pub comparator: Comparator,
    pub value: f64,
    pub severity: Severity,
}

/// Alert lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// A threshold crossing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub metric: String,
    pub observed: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub status: AlertStatus,
}

/// Computed health scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Delivery endpoint for alert transitions.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), String>;
}

/// A sink that logs transitions through `tracing`.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        match alert.status {
            AlertStatus::Firing => warn!(
                metric = %alert.metric,
                observed = alert.observed,
                threshold = alert.threshold,
                severity = ?alert.severity,
                "alert firing"
            ),
            AlertStatus::Resolved => info!(
                metric = %alert.metric,
                observed = alert.observed,
                severity = ?alert.severity,
                "alert resolved"
            ),
        }
        Ok(())
    }
}

/// Live components the monitor samples gauges from each cycle.
#[derive(Clone)]
pub struct GaugeSources {
    pub queue: Arc<PriorityQueue>,
    pub dlq: Arc<DeadLetterQueue>,
    pub breakers: Arc<BreakerRegistry>,
    pub inflight: Arc<InflightTracker>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct AlertState {
    /// Active alert per rule key.
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    last_breaker_opens: u64,
}

/// Stable identity of a rule across evaluation cycles.
fn rule_key(rule: &ThresholdRule) -> String {
    format!(
        "{}|{:?}|{}|{:?}",
        rule.metric, rule.comparator, rule.value, rule.severity
    )
}

/// Metrics aggregation, threshold alerts and health.
pub struct Monitor {
    config: MonitorConfig,
    metrics: Arc<MetricCollector>,
    state: Mutex<AlertState>,
    sinks: Mutex<Vec<Arc<dyn AlertSink>>>,
    /// Thresholds registered after construction; read each cycle.
    extra_rules: Mutex<Vec<ThresholdRule>>,
    events: EventBus,
}

impl Monitor {
    pub fn new(config: MonitorConfig, events: EventBus) -> Self {
        let metrics = Arc::new(MetricCollector::new(config.histogram_window));
        Self {
            config,
            metrics,
            state: Mutex::new(AlertState::default()),
            sinks: Mutex::new(vec![Arc::new(LogSink) as Arc<dyn AlertSink>]),
            extra_rules: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricCollector> {
        &self.metrics
    }

    /// Registers an additional alert delivery sink.
    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    /// Registers an additional threshold; takes effect next cycle.
    pub fn add_threshold(&self, rule: ThresholdRule) {
        self.extra_rules.lock().unwrap().push(rule);
    }

    /// Folds one dispatch event into the collectors.
    pub fn handle_event(&self, event: &DispatchEvent) {
        match &event.kind {
            EventKind::Submitted { .. } => self.metrics.increment("requests.submitted", 1.0),
            EventKind::Dequeued { queued_for, .. } => {
                self.metrics.observe("queue.wait", queued_for.as_secs_f64());
            }
            EventKind::CacheHit => self.metrics.increment("cache.hits", 1.0),
            EventKind::CacheMiss => self.metrics.increment("cache.misses", 1.0),
            EventKind::BreakerRejected { .. } => {
                self.metrics.increment("breaker.rejected", 1.0);
            }
            EventKind::Attempted { .. } => self.metrics.increment("requests.attempted", 1.0),
            EventKind::Succeeded { duration, .. } => {
                self.metrics.increment("requests.succeeded", 1.0);
                self.metrics
                    .observe("request.duration", duration.as_secs_f64());
            }
            EventKind::Failed { .. } => self.metrics.increment("requests.failed", 1.0),
            EventKind::RetryScheduled { .. } => self.metrics.increment("requests.retried", 1.0),
            EventKind::DeadLettered { .. } => self.metrics.increment("dlq.dead_lettered", 1.0),
            EventKind::AlertFiring { .. } | EventKind::AlertResolved { .. } => {}
        }
    }

    /// Samples gauges from the live components.
    pub fn sample_gauges(&self, sources: &GaugeSources) {
        let now = sources.clock.now();
        self.metrics
            .set_gauge("queue.size", sources.queue.len() as f64);
        self.metrics
            .set_gauge("inflight", sources.inflight.len() as f64);
        // Age of the longest-running in-flight request; the built-in stuck
        // rule thresholds on it.
        let oldest = sources
            .inflight
            .oldest_age(now)
            .map(|age| age.as_secs_f64())
            .unwrap_or(0.0);
        self.metrics
            .set_gauge("requests.oldest_inflight_age", oldest);
        self.metrics
            .set_gauge("breaker.open_count", sources.breakers.open_count() as f64);
        self.metrics.set_gauge("dlq.size", sources.dlq.len() as f64);
        self.metrics
            .set_gauge("dlq.dropped", sources.dlq.dropped() as f64);

        let opens = sources.breakers.total_opens();
        let mut state = self.state.lock().unwrap();
        let delta = opens.saturating_sub(state.last_breaker_opens);
        state.last_breaker_opens = opens;
        drop(state);
        if delta > 0 {
            self.metrics.increment("breaker.opens", delta as f64);
        }
    }

    /// Evaluates every threshold against the current sample space, firing and
    /// resolving alerts as they cross. A built-in rule watches the oldest
    /// in-flight age so requests stuck past `stuck_after` surface as HIGH
    /// alerts.
    pub async fn evaluate_thresholds(&self) {
        let space = self.metrics.sample_space();
        let mut rules: Vec<ThresholdRule> = self.config.thresholds.clone();
        rules.extend(self.extra_rules.lock().unwrap().iter().cloned());
        rules.push(ThresholdRule {
            metric: "requests.oldest_inflight_age".to_string(),
            comparator: Comparator::Gt,
            value: self.config.stuck_after.as_secs_f64(),
            severity: Severity::High,
        });

        let mut transitions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for rule in &rules {
                let observed = match space.get(&rule.metric) {
                    Some(v) => *v,
                    None => continue,
                };
                let key = rule_key(rule);
                let crossed = rule.comparator.crossed(observed, rule.value);
                let active = state.active.contains_key(&key);

                if crossed && !active {
                    let alert = Alert {
                        id: Uuid::new_v4().to_string(),
                        severity: rule.severity,
                        metric: rule.metric.clone(),
                        observed,
                        threshold: rule.value,
                        timestamp: Utc::now(),
                        status: AlertStatus::Firing,
                    };
                    state.active.insert(key, alert.clone());
                    push_history(&mut state.history, alert.clone(), self.config.max_alerts);
                    transitions.push(alert);
                } else if !crossed && active {
                    if let Some(mut alert) = state.active.remove(&key) {
                        alert.status = AlertStatus::Resolved;
                        alert.observed = observed;
                        alert.timestamp = Utc::now();
                        push_history(&mut state.history, alert.clone(), self.config.max_alerts);
                        transitions.push(alert);
                    }
                }
            }
        }

        for alert in transitions {
            let kind = match alert.status {
                AlertStatus::Firing => EventKind::AlertFiring {
                    alert: alert.clone(),
                },
                AlertStatus::Resolved => EventKind::AlertResolved {
                    alert: alert.clone(),
                },
            };
            self.events.emit(None, kind);
            self.deliver(&alert).await;
        }
    }

    async fn deliver(&self, alert: &Alert) {
        let sinks: Vec<Arc<dyn AlertSink>> = self.sinks.lock().unwrap().clone();
        for sink in sinks {
            match tokio::time::timeout(SINK_TIMEOUT, sink.deliver(alert)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(metric = %alert.metric, error = %e, "alert sink failed"),
                Err(_) => warn!(metric = %alert.metric, "alert sink timed out"),
            }
        }
    }

    /// Health derived from the active alert set: any CRITICAL firing is
    /// unhealthy, any HIGH degrades, otherwise healthy.
    pub fn health(&self) -> Health {
        let state = self.state.lock().unwrap();
        let mut worst = Health::Healthy;
        for alert in state.active.values() {
            match alert.severity {
                Severity::Critical => return Health::Unhealthy,
                Severity::High => worst = Health::Degraded,
                _ => {}
            }
        }
        worst
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.state.lock().unwrap().active.values().cloned().collect()
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        self.state.lock().unwrap().history.iter().cloned().collect()
    }

    /// Drives the monitor: drains events and runs the sampling cycle until
    /// shutdown fires and the event stream closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DispatchEvent>,
        mut shutdown: watch::Receiver<bool>,
        sources: GaugeSources,
    ) {
        let mut tick = tokio::time::interval(self.config.collect_interval.max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_event(&event),
                    None => break,
                },
                _ = tick.tick() => {
                    self.sample_gauges(&sources);
                    self.evaluate_thresholds().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain whatever is already queued, then stop.
                        while let Ok(event) = events.try_recv() {
                            self.handle_event(&event);
                        }
                        break;
                    }
                }
            }
        }

        self.sample_gauges(&sources);
        self.evaluate_thresholds().await;
        info!("monitor stopped");
    }
}

fn push_history(history: &mut VecDeque<Alert>, alert: Alert, cap: usize) {
    history.push_back(alert);
    while history.len() > cap.max(1) {
        history.pop_front();
    }
}
