//! Retry policies for failing step invocations.

use std::{fmt::Debug, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Decides whether a failed invocation is re-run.
///
/// `attempts` is the number of invocations made so far, including the one
/// that just failed. Returning `Some(delay)` re-runs the same invocation with
/// the same event after `delay`; `None` makes the failure fatal.
pub trait RetryPolicy: Send + Sync + Debug {
    fn next(&self, elapsed: Duration, attempts: u32, error: &FlowError) -> Option<Duration>;
}

/// Fixed delay between attempts.
///
/// A step that always fails is invoked exactly `maximum_attempts` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantDelayRetryPolicy {
    #[serde(with = "crate::config::duration_millis")]
    pub delay: Duration,
    pub maximum_attempts: u32,
}

impl ConstantDelayRetryPolicy {
    pub fn new(delay: Duration, maximum_attempts: u32) -> Self {
        Self {
            delay,
            maximum_attempts,
        }
    }
}

impl Default for ConstantDelayRetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 3)
    }
}

impl RetryPolicy for ConstantDelayRetryPolicy {
    fn next(&self, _elapsed: Duration, attempts: u32, _error: &FlowError) -> Option<Duration> {
        (attempts < self.maximum_attempts).then_some(self.delay)
    }
}

/// Exponential backoff with an optional jitter factor.
///
/// ```
/// use std::time::Duration;
/// use eventloom_core::retry::ExponentialBackoffRetryPolicy;
///
/// // 100ms, 200ms, 400ms, ... capped at 2s, five invocations in total
/// let policy = ExponentialBackoffRetryPolicy::default()
///     .with_initial_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(2))
///     .with_maximum_attempts(5);
/// assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialBackoffRetryPolicy {
    #[serde(with = "crate::config::duration_millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "crate::config::duration_millis")]
    pub max_delay: Duration,
    pub maximum_attempts: u32,
    /// Jitter factor in `0.0..=1.0`; `0.1` means +/-10%.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for ExponentialBackoffRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            maximum_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl ExponentialBackoffRetryPolicy {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        seconds(base.min(self.max_delay.as_secs_f64()))
    }
}

/// Non-negative seconds to a `Duration`, saturating instead of panicking.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

impl RetryPolicy for ExponentialBackoffRetryPolicy {
    fn next(&self, _elapsed: Duration, attempts: u32, _error: &FlowError) -> Option<Duration> {
        if attempts >= self.maximum_attempts {
            return None;
        }
        let capped = self.delay_for_retry(attempts);
        // Deserialized policies bypass `with_jitter`.
        let jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        if jitter == 0.0 || capped.is_zero() {
            return Some(capped);
        }
        let capped = capped.as_secs_f64();
        let offset = (fastrand::f64() * 2.0 - 1.0) * capped * jitter;
        Some(seconds(capped + offset))
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next(&self, _elapsed: Duration, _attempts: u32, _error: &FlowError) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> FlowError {
        FlowError::msg("boom")
    }

    #[test]
    fn constant_delay_gives_up_after_maximum() {
        let policy = ConstantDelayRetryPolicy::new(Duration::from_millis(10), 3);
        let elapsed = Duration::ZERO;
        assert_eq!(
            policy.next(elapsed, 1, &err()),
            Some(Duration::from_millis(10))
        );
        assert_eq!(
            policy.next(elapsed, 2, &err()),
            Some(Duration::from_millis(10))
        );
        assert_eq!(policy.next(elapsed, 3, &err()), None);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ExponentialBackoffRetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_maximum_attempts(10);

        let delays: Vec<_> = (1..=5)
            .map(|n| policy.next(Duration::ZERO, n, &err()).unwrap())
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        assert_eq!(policy.next(Duration::ZERO, 10, &err()), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = ExponentialBackoffRetryPolicy::default()
            .with_initial_delay(Duration::from_millis(1000))
            .with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.next(Duration::ZERO, 1, &err()).unwrap();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn deserialized_jitter_is_clamped() {
        let policy: ExponentialBackoffRetryPolicy = serde_json::from_str(
            r#"{"initial_delay": 1000, "multiplier": 2.0, "max_delay": 4000,
                "maximum_attempts": 3, "jitter": 1e300}"#,
        )
        .unwrap();
        for _ in 0..100 {
            let delay = policy.next(Duration::ZERO, 1, &err()).unwrap();
            assert!(delay <= Duration::from_millis(2000), "{delay:?}");
        }

        let huge = ExponentialBackoffRetryPolicy::default()
            .with_multiplier(1e300)
            .with_max_delay(Duration::MAX)
            .with_maximum_attempts(10);
        assert_eq!(huge.delay_for_retry(5), Duration::MAX);
    }

    #[test]
    fn policy_serde() {
        let policy: ConstantDelayRetryPolicy =
            serde_json::from_str(r#"{"delay": 250, "maximum_attempts": 4}"#).unwrap();
        assert_eq!(policy, ConstantDelayRetryPolicy::new(Duration::from_millis(250), 4));
        assert_eq!(NoRetry.next(Duration::ZERO, 1, &err()), None);
    }
}
