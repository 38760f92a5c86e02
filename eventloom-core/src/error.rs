//! Error types for EventLoom.

use std::time::Duration;

use thiserror::Error;

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Error types that can occur while building or running a workflow.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Context or state store error.
    #[error("Context error: {0}")]
    Context(String),

    /// Workflow construction error, detected before any run starts.
    #[error("Construction error: {0}")]
    Construction(String),

    /// A write violated the state schema.
    #[error("State validation error: {0}")]
    Validation(String),

    /// Resource lookup or construction failed.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Event stream misuse.
    #[error("Stream error: {0}")]
    Stream(String),

    /// A step failed and no retry policy recovered it.
    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        /// Name of the failing step
        step: String,
        /// Error description
        message: String,
        /// Number of invocations made
        attempts: u32,
    },

    /// Serialization/Deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error, usually raised from inside a step body.
    #[error("Error: {0}")]
    Generic(#[from] eyre::Report),

    /// Workflow run was cancelled.
    #[error("Workflow run was cancelled")]
    Cancelled,

    /// Workflow run timed out.
    #[error("Workflow run timed out after {0:?}")]
    Timeout(Duration),
}

impl FlowError {
    /// Create a new context error.
    pub fn context(msg: impl Into<String>) -> Self {
        Self::Context(msg.into())
    }

    /// Create a new construction error.
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }

    /// Create a new validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new resource error.
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Wrap an arbitrary error raised by a step body.
    ///
    /// The original error stays reachable through [`FlowError::downcast_ref`].
    pub fn step<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Generic(eyre::Report::new(err))
    }

    /// Create a generic error from a message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Generic(eyre::eyre!(msg.into()))
    }

    /// Borrow the wrapped step error as `E`, if that is what it is.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Generic(report) => report.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether this error is a terminal run outcome rather than a step error.
    pub fn is_run_outcome(&self) -> bool {
        matches!(
            self,
            Self::StepFailed { .. } | Self::Cancelled | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("transient")]
    struct Transient;

    #[test]
    fn downcast_wrapped_step_error() {
        let err = FlowError::step(Transient);
        assert!(err.downcast_ref::<Transient>().is_some());
        assert!(FlowError::msg("boom").downcast_ref::<Transient>().is_none());
        assert!(FlowError::Cancelled.downcast_ref::<Transient>().is_none());
    }

    #[test]
    fn step_failed_message() {
        let err = FlowError::StepFailed {
            step: "fetch".into(),
            message: "connection reset".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Step 'fetch' failed after 3 attempt(s): connection reset"
        );
        assert!(err.is_run_outcome());
        assert!(!FlowError::context("x").is_run_outcome());
    }
}
