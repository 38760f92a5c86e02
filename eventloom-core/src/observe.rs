//! Step invocation spans and the sinks that receive them.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

/// Record of one step invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpan {
    pub run_id: Uuid,
    pub step: String,
    /// 1-based attempt number within the invocation.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: Event,
    pub output: Option<Event>,
    pub error: Option<String>,
}

impl StepSpan {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Receives a span for every invocation attempt.
///
/// Sinks observe only; they cannot influence the run.
pub trait SpanSink: Send + Sync + Debug {
    fn record(&self, span: &StepSpan);
}

/// Logs spans through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl SpanSink for TracingSink {
    fn record(&self, span: &StepSpan) {
        let elapsed_ms = u64::try_from(span.duration().as_millis()).unwrap_or(u64::MAX);
        match &span.error {
            None => tracing::info!(
                run_id = %span.run_id,
                step = %span.step,
                attempt = span.attempt,
                elapsed_ms,
                input = %span.input.kind(),
                output = span.output.as_ref().map(Event::kind).unwrap_or("-"),
                "step finished"
            ),
            Some(error) => tracing::warn!(
                run_id = %span.run_id,
                step = %span.step,
                attempt = span.attempt,
                elapsed_ms,
                input = %span.input.kind(),
                %error,
                "step failed"
            ),
        }
    }
}

/// Keeps spans in memory, mainly for tests and [`crate::draw::draw_execution`].
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    spans: Arc<Mutex<Vec<StepSpan>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All spans recorded so far, in arrival order.
    pub fn spans(&self) -> Vec<StepSpan> {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Spans of one run.
    pub fn spans_for(&self, run_id: Uuid) -> Vec<StepSpan> {
        self.spans()
            .into_iter()
            .filter(|span| span.run_id == run_id)
            .collect()
    }

    pub fn clear(&self) {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl SpanSink for InMemorySink {
    fn record(&self, span: &StepSpan) {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(span.clone());
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn span(step: &str, error: Option<&str>) -> StepSpan {
        let started_at = Utc::now();
        StepSpan {
            run_id: Uuid::nil(),
            step: step.to_string(),
            attempt: 1,
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(5),
            input: Event::new("start"),
            output: error.is_none().then(|| Event::new("stop")),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn in_memory_sink_records_in_order() {
        let sink = InMemorySink::new();
        sink.record(&span("a", None));
        sink.record(&span("b", Some("boom")));

        let spans = sink.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].step, "a");
        assert!(spans[0].succeeded());
        assert!(!spans[1].succeeded());
        assert_eq!(spans[0].duration(), Duration::from_millis(5));

        assert_eq!(sink.spans_for(Uuid::new_v4()).len(), 0);
        sink.clear();
        assert!(sink.spans().is_empty());
    }

    #[test]
    #[traced_test]
    fn tracing_sink_logs() {
        TracingSink.record(&self::span("fetch", Some("connection reset")));
        assert!(logs_contain("step failed"));
        assert!(logs_contain("connection reset"));
    }
}
