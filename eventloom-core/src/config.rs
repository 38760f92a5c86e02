//! Workflow configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Environment variable overriding [`WorkflowConfig::timeout`], in seconds.
/// `0` disables the timeout.
pub const ENV_TIMEOUT_SECS: &str = "EVENTLOOM_TIMEOUT_SECS";
/// Environment variable overriding [`WorkflowConfig::verbose`].
pub const ENV_VERBOSE: &str = "EVENTLOOM_VERBOSE";

/// What happens to step invocations still running when a run terminates.
///
/// Their results are discarded in every mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Let them run to completion in the background.
    #[default]
    Detach,
    /// Abort their tasks.
    Abort,
    /// Wait up to `grace` for them before resolving the run, then abort.
    Drain {
        #[serde(with = "duration_millis")]
        grace: Duration,
    },
}

/// Workflow configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Global run timeout; `None` disables it.
    #[serde(with = "option_duration_secs")]
    pub timeout: Option<Duration>,
    /// Concurrency width of steps that do not set their own.
    pub default_concurrency: usize,
    /// Handling of in-flight invocations at termination.
    pub in_flight: InFlightPolicy,
    /// Log step start/finish at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(45)),
            default_concurrency: 4,
            in_flight: InFlightPolicy::Detach,
            verbose: false,
        }
    }
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_default_concurrency(mut self, width: usize) -> Self {
        self.default_concurrency = width;
        self
    }

    pub fn with_in_flight(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight = policy;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(FlowError::from)
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(FlowError::from)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            _ => Err(FlowError::construction(format!(
                "unsupported config format: {}",
                path.display()
            ))),
        }
    }

    /// Apply `EVENTLOOM_TIMEOUT_SECS` and `EVENTLOOM_VERBOSE` if set.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(
            std::env::var(ENV_TIMEOUT_SECS).ok().as_deref(),
            std::env::var(ENV_VERBOSE).ok().as_deref(),
        )
    }

    fn apply_overrides(mut self, timeout: Option<&str>, verbose: Option<&str>) -> Result<Self> {
        if let Some(raw) = timeout {
            let secs: f64 = raw.trim().parse().map_err(|_| {
                FlowError::construction(format!("{ENV_TIMEOUT_SECS} must be a number, got '{raw}'"))
            })?;
            let timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
                FlowError::construction(format!("{ENV_TIMEOUT_SECS} is out of range, got '{raw}': {e}"))
            })?;
            self.timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(raw) = verbose {
            self.verbose = matches!(raw.trim(), "1" | "true" | "yes" | "on");
        }
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.default_concurrency == 0 {
            return Err(FlowError::construction(
                "default_concurrency must be at least 1",
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(FlowError::construction(
                "timeout must be positive, use None to disable it",
            ));
        }
        Ok(())
    }
}

/// Serde support for `Duration` as milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde support for `Option<Duration>` as fractional seconds.
mod option_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    serde::de::Error::custom(format!("invalid timeout of {secs} seconds: {e}"))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config = WorkflowConfig::default();
        assert_eq!(config.timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.default_concurrency, 4);
        assert_eq!(config.in_flight, InFlightPolicy::Detach);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_and_json() {
        let yaml = "timeout: 2.5\nin_flight:\n  mode: drain\n  grace: 200\nverbose: true\n";
        let config = WorkflowConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(
            config.in_flight,
            InFlightPolicy::Drain {
                grace: Duration::from_millis(200)
            }
        );
        assert!(config.verbose);
        assert_eq!(config.default_concurrency, 4);

        let json = r#"{"timeout": null, "default_concurrency": 8, "in_flight": {"mode": "abort"}}"#;
        let config = WorkflowConfig::from_json_str(json).unwrap();
        assert_eq!(config.timeout, None);
        assert_eq!(config.default_concurrency, 8);
        assert_eq!(config.in_flight, InFlightPolicy::Abort);
    }

    #[test]
    fn env_style_overrides() {
        let config = WorkflowConfig::default()
            .apply_overrides(Some("10"), Some("true"))
            .unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert!(config.verbose);

        let config = WorkflowConfig::default()
            .apply_overrides(Some("0"), None)
            .unwrap();
        assert_eq!(config.timeout, None);

        assert!(
            WorkflowConfig::default()
                .apply_overrides(Some("soon"), None)
                .is_err()
        );
    }

    #[test]
    fn out_of_range_timeouts_are_errors() {
        for raw in ["1e20", "-1", "inf", "NaN"] {
            let err = WorkflowConfig::default()
                .apply_overrides(Some(raw), None)
                .unwrap_err();
            assert!(matches!(err, FlowError::Construction(_)), "{raw}: {err}");
        }

        assert!(WorkflowConfig::from_yaml_str("timeout: 1e20\n").is_err());
        assert!(WorkflowConfig::from_json_str(r#"{"timeout": 1e20}"#).is_err());
        assert!(WorkflowConfig::from_json_str(r#"{"timeout": -3}"#).is_err());
    }

    #[test]
    fn huge_grace_serializes_saturated() {
        let config = WorkflowConfig::default().with_in_flight(InFlightPolicy::Drain {
            grace: Duration::MAX,
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["in_flight"]["grace"], serde_json::json!(u64::MAX));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = WorkflowConfig::default().with_default_concurrency(0);
        assert!(matches!(config.validate(), Err(FlowError::Construction(_))));
    }
}
