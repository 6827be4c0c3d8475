//! # Retry Policy
//!
//! Pure attempt scheduling under exponential backoff. The policy is a
//! function over (attempt number, attempt signal): it never sleeps, never
//! touches shared state, and returns a [`RetryDecision`] the dispatcher acts
//! on by re-enqueueing with a delayed eligibility timestamp.
//!
//! Retryable signals are transport errors, timeouts, and the transient
//! status family {429, 502, 503, 504}. Everything else, including plain
//! 500s and all other 4xx, fails fast; the circuit breaker, not the retry
//! loop, is the defense against a persistently broken origin.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::descriptor::RetryOverrides;

/// What the dispatcher observed for one attempt, reduced to the fields the
/// retry decision needs.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptSignal {
    /// A response arrived; `retry_after` carries a parsed `Retry-After` value
    /// when the server advertised one.
    Response {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// The transport reported a network-level failure.
    TransportError,
    /// The attempt exceeded its deadline.
    Timeout,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Statuses worth retrying: rate limiting and transient upstream failures.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Attempt scheduling policy. Cheap to clone; carries only configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decides whether the attempt that just finished should be retried.
    ///
    /// `attempt` is 1-based: after attempt `n` fails, a retry is allowed
    /// while `n <= max_retries`, keeping total attempts at `max_retries + 1`.
    /// Per-descriptor overrides narrow the defaults.
    pub fn decide(
        &self,
        overrides: &RetryOverrides,
        attempt: u32,
        signal: &AttemptSignal,
    ) -> RetryDecision {
        let max_retries = overrides.max_retries.unwrap_or(self.config.max_retries);
        if attempt > max_retries {
            return RetryDecision::GiveUp;
        }

        let retry_after = match signal {
            AttemptSignal::Response {
                status,
                retry_after,
            } => {
                if !is_retryable_status(*status) {
                    return RetryDecision::GiveUp;
                }
                *retry_after
            }
            AttemptSignal::TransportError | AttemptSignal::Timeout => None,
        };

        let delay = match retry_after {
            // Server-advertised delay wins over the computed backoff.
            Some(advertised) => advertised.min(self.config.max_delay),
            None => self.backoff_delay(overrides, attempt),
        };

        RetryDecision::Retry { delay }
    }

    /// `base · 2^(attempt−1)`, ±25% uniform jitter, capped at `max_delay`.
    fn backoff_delay(&self, overrides: &RetryOverrides, attempt: u32) -> Duration {
        let base = overrides.base_delay.unwrap_or(self.config.base_delay);
        let exp = attempt.saturating_sub(1).min(31);
        let raw = base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.config.max_delay);

        if !self.config.jitter || capped.is_zero() {
            return capped;
        }

        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        capped.mul_f64(factor).min(self.config.max_delay)
    }
}

/// Parses a `Retry-After` header value: delta-seconds or an HTTP-date.
///
/// `now` is the current wall clock in epoch nanoseconds; date forms resolve
/// to the remaining delta, floored at zero.
pub fn parse_retry_after(value: &str, now: crate::clock::EpochNanos) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let target = when.timestamp_nanos_opt()?;
    let delta = target.saturating_sub(now);
    if delta <= 0 {
        Some(Duration::ZERO)
    } else {
        Some(Duration::from_nanos(delta as u64))
    }
}
