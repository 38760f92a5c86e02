//! Retry policy for provider and tool failures.

use std::time::Duration;

use eventloom_core::prelude::{ExponentialBackoffRetryPolicy, FlowError, RetryPolicy};

use crate::error::AgentError;

/// Retries only errors that [`AgentError::is_retryable`] classifies as
/// transient, with exponential backoff. Anything else fails immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRetryPolicy {
    backoff: ExponentialBackoffRetryPolicy,
}

impl Default for AgentRetryPolicy {
    fn default() -> Self {
        Self {
            backoff: ExponentialBackoffRetryPolicy::default()
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(10))
                .with_maximum_attempts(4)
                .with_jitter(0.1),
        }
    }
}

impl AgentRetryPolicy {
    pub fn new(backoff: ExponentialBackoffRetryPolicy) -> Self {
        Self { backoff }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.backoff = self.backoff.with_initial_delay(delay);
        self
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.backoff = self.backoff.with_maximum_attempts(attempts);
        self
    }
}

impl RetryPolicy for AgentRetryPolicy {
    fn next(&self, elapsed: Duration, attempts: u32, error: &FlowError) -> Option<Duration> {
        let retryable = error
            .downcast_ref::<AgentError>()
            .is_some_and(AgentError::is_retryable);
        if !retryable {
            return None;
        }
        self.backoff.next(elapsed, attempts, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_agent_errors_retry() {
        let policy = AgentRetryPolicy::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_maximum_attempts(3);
        let transient: FlowError = AgentError::timeout("model took too long").into();
        let permanent: FlowError = AgentError::validation("bad prompt").into();
        let foreign = FlowError::msg("plain failure");

        assert!(policy.next(Duration::ZERO, 1, &transient).is_some());
        assert!(policy.next(Duration::ZERO, 3, &transient).is_none());
        assert!(policy.next(Duration::ZERO, 1, &permanent).is_none());
        assert!(policy.next(Duration::ZERO, 1, &foreign).is_none());
    }
}
