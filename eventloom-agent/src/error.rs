//! Errors raised by providers, tools and agent steps.

use eventloom_core::prelude::FlowError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Failure of a completion provider or tool.
///
/// Provider implementations report transient failures as [`Model`],
/// [`Timeout`] or [`RateLimit`]; [`AgentRetryPolicy`] retries exactly those.
///
/// [`Model`]: AgentError::Model
/// [`Timeout`]: AgentError::Timeout
/// [`RateLimit`]: AgentError::RateLimit
/// [`AgentRetryPolicy`]: crate::retry::AgentRetryPolicy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// Misconfigured registry or exhausted script.
    #[error("configuration: {0}")]
    Configuration(String),

    /// The model backend failed to answer.
    #[error("model failed: {0}")]
    Model(String),

    /// A request or tool call carried bad input.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    /// A tool call named a tool that is not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A workflow error surfaced inside agent code.
    #[error("workflow: {0}")]
    Flow(String),
}

impl AgentError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    pub fn unknown_tool(tool: impl Into<String>) -> Self {
        Self::UnknownTool(tool.into())
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Model(_) | Self::Timeout(_) | Self::RateLimit(_)
        )
    }

    /// Short label for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Model(_) => "model",
            Self::Validation(_) => "validation",
            Self::Timeout(_) => "timeout",
            Self::RateLimit(_) => "rate_limit",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Flow(_) => "flow",
        }
    }
}

// Wrapped as a step error so retry policies can downcast it.
impl From<AgentError> for FlowError {
    fn from(err: AgentError) -> Self {
        FlowError::step(err)
    }
}

impl From<FlowError> for AgentError {
    fn from(err: FlowError) -> Self {
        match err.downcast_ref::<AgentError>() {
            Some(agent) => agent.clone(),
            None => Self::Flow(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        for err in [
            AgentError::model("overloaded"),
            AgentError::timeout("30s"),
            AgentError::rate_limit("429"),
        ] {
            assert!(err.is_retryable(), "{err}");
        }
        for err in [
            AgentError::configuration("empty script"),
            AgentError::validation("missing 'a'"),
            AgentError::unknown_tool("rm"),
        ] {
            assert!(!err.is_retryable(), "{err}");
        }
        assert_eq!(AgentError::unknown_tool("rm").to_string(), "unknown tool: rm");
    }

    #[test]
    fn flow_error_round_trip_keeps_agent_error() {
        let flow: FlowError = AgentError::rate_limit("slow down").into();
        assert_eq!(
            flow.downcast_ref::<AgentError>(),
            Some(&AgentError::rate_limit("slow down"))
        );
        assert_eq!(AgentError::from(flow), AgentError::rate_limit("slow down"));

        let other = AgentError::from(FlowError::context("boom"));
        assert_eq!(other.category(), "flow");
    }
}
