//! Configuration for the dispatcher.
//!
//! Provides nested config sections for each engine component, a fluent
//! [`ConfigBuilder`], and loading from TOML files or environment variables.
//! String-typed knobs (priorities, comparators) are parsed here at the
//! boundary; the engine only ever sees typed values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::monitor::ThresholdRule;

/// Top-level dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of worker tasks pulling from the queue.
    pub max_concurrent_requests: usize,

    /// Default per-attempt timeout for descriptors that do not carry one.
    pub request_timeout: Duration,

    /// Statuses treated as success in addition to 2xx.
    pub extra_success_statuses: Vec<u16>,

    /// Queue sizing, expiry and persistence.
    pub queue: QueueConfig,

    /// Global rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Retry/backoff policy defaults.
    pub retry: RetryConfig,

    /// Response cache.
    pub cache: CacheConfig,

    /// Per-origin circuit breakers.
    pub breaker: BreakerConfig,

    /// Metrics aggregation and alerting.
    pub monitor: MonitorConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 50,
            request_timeout: Duration::from_secs(30),
            extra_success_statuses: vec![],
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Whether `status` counts as a successful outcome.
    pub fn is_success_status(&self, status: u16) -> bool {
        (200..300).contains(&status) || self.extra_success_statuses.contains(&status)
    }
}

/// Queue sizing, expiry and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum pending entries before `submit` refuses with `QueueFull`.
    pub max_size: usize,

    /// Wall-clock lifetime of a queued entry; older entries dead-letter.
    pub item_ttl: Duration,

    /// Dead-letter queue capacity; oldest entries drop when exceeded.
    pub dlq_max_size: usize,

    /// Snapshot file for crash-recovery persistence. `None` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            item_ttl: Duration::from_secs(3_600),
            dlq_max_size: 100,
            persist_path: None,
        }
    }
}

/// Global rate limiting (token bucket shared by all workers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained request rate in tokens per second.
    pub per_second: u32,

    /// Burst capacity. Defaults to one second's worth of tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 100,
            burst: None,
        }
    }
}

/// Retry/backoff policy defaults; individual descriptors may narrow them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,

    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,

    /// Ceiling on any computed or server-advertised delay.
    pub max_delay: Duration,

    /// Apply ±25% uniform jitter to computed delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Entry lifetime from write.
    pub ttl: Duration,

    /// LRU capacity.
    pub max_entries: usize,

    /// Statuses stored in addition to 2xx.
    pub cacheable_statuses: Vec<u16>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3_600),
            max_entries: 1_024,
            cacheable_statuses: vec![],
        }
    }
}

impl CacheConfig {
    /// Whether a response with `status` may be written to the cache.
    pub fn is_cacheable_status(&self, status: u16) -> bool {
        (200..300).contains(&status) || self.cacheable_statuses.contains(&status)
    }
}

/// Per-origin circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Cool-down before an open circuit admits probes.
    pub timeout: Duration,

    /// Concurrent probes allowed while half-open.
    pub half_open_max_calls: u32,

    /// Probe successes required to close from half-open.
    pub probe_required: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            probe_required: 2,
        }
    }
}

/// Metrics aggregation and alerting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Gauge/threshold sampling period.
    pub collect_interval: Duration,

    /// Rolling-window size for histogram metrics.
    pub histogram_window: usize,

    /// Cap on retained alerts; oldest resolved alerts evict first.
    pub max_alerts: usize,

    /// In-flight age past which a stuck-request alert fires at HIGH severity.
    pub stuck_after: Duration,

    /// Threshold rules evaluated every collection cycle.
    pub thresholds: Vec<ThresholdRule>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(5),
            histogram_window: 1_024,
            max_alerts: 1_000,
            stuck_after: Duration::from_secs(300),
            thresholds: vec![],
        }
    }
}

/// Fluent builder over [`DispatchConfig`].
pub struct ConfigBuilder {
    config: DispatchConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.max_concurrent_requests = n;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn queue_size(mut self, n: usize) -> Self {
        self.config.queue.max_size = n;
        self
    }

    pub fn queue_item_ttl(mut self, ttl: Duration) -> Self {
        self.config.queue.item_ttl = ttl;
        self
    }

    pub fn persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.queue.persist_path = Some(path.into());
        self
    }

    pub fn rate_limit(mut self, per_second: u32) -> Self {
        self.config.rate_limit.per_second = per_second;
        self
    }

    pub fn burst(mut self, burst: u32) -> Self {
        self.config.rate_limit.burst = Some(burst);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.ttl = ttl;
        self
    }

    pub fn breaker_failure_threshold(mut self, n: u32) -> Self {
        self.config.breaker.failure_threshold = n;
        self
    }

    pub fn breaker_timeout(mut self, timeout: Duration) -> Self {
        self.config.breaker.timeout = timeout;
        self
    }

    pub fn collect_interval(mut self, interval: Duration) -> Self {
        self.config.monitor.collect_interval = interval;
        self
    }

    pub fn threshold(mut self, rule: ThresholdRule) -> Self {
        self.config.monitor.thresholds.push(rule);
        self
    }

    pub fn build(self) -> DispatchConfig {
        self.config
    }
}

/// Loads configuration from a TOML file.
pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<DispatchConfig> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|e| crate::error::DispatchError::Config(e.to_string()))
}

/// Builds a config from defaults plus recognized environment variables.
///
/// Recognized: `DISPATCHQ_WORKERS`, `DISPATCHQ_RATE_LIMIT`,
/// `DISPATCHQ_MAX_RETRIES`, `DISPATCHQ_QUEUE_SIZE`, `DISPATCHQ_CACHE_ENABLED`,
/// `DISPATCHQ_PERSIST_PATH`.
pub fn from_env() -> DispatchConfig {
    let mut config = DispatchConfig::default();

    if let Ok(v) = std::env::var("DISPATCHQ_WORKERS") {
        if let Ok(n) = v.parse() {
            config.max_concurrent_requests = n;
        }
    }
    if let Ok(v) = std::env::var("DISPATCHQ_RATE_LIMIT") {
        if let Ok(n) = v.parse() {
            config.rate_limit.per_second = n;
        }
    }
    if let Ok(v) = std::env::var("DISPATCHQ_MAX_RETRIES") {
        if let Ok(n) = v.parse() {
            config.retry.max_retries = n;
        }
    }
    if let Ok(v) = std::env::var("DISPATCHQ_QUEUE_SIZE") {
        if let Ok(n) = v.parse() {
            config.queue.max_size = n;
        }
    }
    if let Ok(v) = std::env::var("DISPATCHQ_CACHE_ENABLED") {
        config.cache.enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = std::env::var("DISPATCHQ_PERSIST_PATH") {
        config.queue.persist_path = Some(PathBuf::from(v));
    }

    config
}
