//! # Metric Collection
//!
//! Rolling in-memory aggregation: monotonic counters, last-value gauges, and
//! bounded-window histograms summarized as count/min/max/avg/percentiles.
//! Aggregation is sampled, not transactional; the monitor reads a coherent
//! snapshot per collection cycle, nothing more.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Metric taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One exported metric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

/// Summary statistics over a histogram window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct CollectorInner {
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, VecDeque<f64>>,
}

/// Thread-safe metric store with bounded histogram windows.
pub struct MetricCollector {
    window: usize,
    inner: Mutex<CollectorInner>,
}

impl MetricCollector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            inner: Mutex::new(CollectorInner::default()),
        }
    }

    pub fn increment(&self, name: &str, by: f64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(name.to_string()).or_insert(0.0) += by;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.gauges.insert(name.to_string(), value);
    }

    /// Records one histogram observation, trimming the window.
    pub fn observe(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock().unwrap();
        let window = inner
            .histograms
            .entry(name.to_string())
            .or_insert_with(VecDeque::new);
        window.push_back(value);
        while window.len() > self.window {
            window.pop_front();
        }
    }

    pub fn counter(&self, name: &str) -> f64 {
        self.inner
            .lock()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.inner.lock().unwrap().gauges.get(name).copied()
    }

    pub fn summary(&self, name: &str) -> Option<HistogramSummary> {
        let inner = self.inner.lock().unwrap();
        let window = inner.histograms.get(name)?;
        summarize(window)
    }

    /// Flat view of every metric for threshold evaluation: counters and
    /// gauges under their own names, histograms expanded as
    /// `name.{min,max,avg,p50,p95,p99,count}`.
    pub fn sample_space(&self) -> HashMap<String, f64> {
        let inner = self.inner.lock().unwrap();
        let mut space = HashMap::new();
        for (name, value) in &inner.counters {
            space.insert(name.clone(), *value);
        }
        for (name, value) in &inner.gauges {
            space.insert(name.clone(), *value);
        }
        for (name, window) in &inner.histograms {
            if let Some(s) = summarize(window) {
                space.insert(format!("{name}.count"), s.count as f64);
                space.insert(format!("{name}.min"), s.min);
                space.insert(format!("{name}.max"), s.max);
                space.insert(format!("{name}.avg"), s.avg);
                space.insert(format!("{name}.p50"), s.p50);
                space.insert(format!("{name}.p95"), s.p95);
                space.insert(format!("{name}.p99"), s.p99);
            }
        }
        space
    }

    /// Point-in-time export of all metrics.
    pub fn export(&self) -> Vec<MetricPoint> {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();
        let mut points = Vec::new();
        for (name, value) in &inner.counters {
            points.push(MetricPoint {
                name: name.clone(),
                kind: MetricKind::Counter,
                value: *value,
                timestamp: now,
                labels: HashMap::new(),
            });
        }
        for (name, value) in &inner.gauges {
            points.push(MetricPoint {
                name: name.clone(),
                kind: MetricKind::Gauge,
                value: *value,
                timestamp: now,
                labels: HashMap::new(),
            });
        }
        for (name, window) in &inner.histograms {
            if let Some(s) = summarize(window) {
                points.push(MetricPoint {
                    name: format!("{name}.p95"),
                    kind: MetricKind::Histogram,
                    value: s.p95,
                    timestamp: now,
                    labels: HashMap::new(),
                });
            }
        }
        points.sort_by(|a, b| a.name.cmp(&b.name));
        points
    }
}

fn summarize(window: &VecDeque<f64>) -> Option<HistogramSummary> {
    if window.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    Some(HistogramSummary {
        count,
        min: sorted[0],
        max: sorted[count - 1],
        avg: sum / count as f64,
        p50: percentile(&sorted, 0.50),
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
    })
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len()) - 1;
    sorted[idx]
}
