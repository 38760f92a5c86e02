//! Steps that call a completion provider.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use eventloom_core::prelude::{
    Event, EventPayload, Result as FlowResult, Step, StepContext, StepSpec,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{Completion, CompletionProvider, CompletionRequest, StreamChunk};

/// One streamed text delta, written to the run stream as `progress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub step: String,
    pub delta: String,
    /// Position of the delta within its completion, from 0.
    pub index: usize,
}

impl EventPayload for Progress {
    const KIND: &'static str = "progress";
}

type PromptFn = dyn Fn(&Event) -> FlowResult<CompletionRequest> + Send + Sync;
type OutputFn = dyn Fn(&Event, Completion) -> FlowResult<Event> + Send + Sync;

struct CompletionStep {
    provider: Arc<dyn CompletionProvider>,
    prompt_fn: Box<PromptFn>,
    output_fn: Box<OutputFn>,
}

impl fmt::Debug for CompletionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionStep")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for CompletionStep {
    async fn run(&self, ctx: StepContext, event: Arc<Event>) -> FlowResult<Option<Event>> {
        let request = (self.prompt_fn)(&event)?;
        let mut deltas = self.provider.stream_complete(&request).await?;

        let mut text = String::new();
        let mut usage = None;
        let mut index = 0;
        while let Some(chunk) = deltas.next().await {
            match chunk? {
                StreamChunk::Token(delta) => {
                    ctx.write_event_to_stream(Event::from_payload(&Progress {
                        step: ctx.step_name().to_string(),
                        delta: delta.clone(),
                        index,
                    })?);
                    text.push_str(&delta);
                    index += 1;
                }
                StreamChunk::Usage(reported) => usage = Some(reported),
            }
        }
        debug!(
            provider = self.provider.name(),
            deltas = index,
            chars = text.len(),
            total_tokens = usage.map(|u| u.total_tokens),
            "completion finished"
        );

        let output = (self.output_fn)(&event, Completion { text, usage })?;
        Ok(Some(output))
    }
}

/// Declare a step that prompts `provider` and turns the answer into an event.
///
/// `prompt_fn` builds the request from the triggering event, `output_fn`
/// builds the emitted event from the finished completion. Deltas are written
/// to the run stream as [`Progress`] events while the completion streams.
/// Add the output kind with [`StepSpec::emits`].
///
/// ```rust
/// use std::sync::Arc;
///
/// use eventloom_agent::prelude::*;
/// use eventloom_core::prelude::{Event, Workflow};
///
/// let provider = Arc::new(ScriptedProvider::new(["Why did the crab cross the road?"]));
/// let workflow = Workflow::builder()
///     .step(
///         completion_step(
///             "joke",
///             provider,
///             "start",
///             |event| {
///                 let topic: String = event.get("topic")?.unwrap_or_default();
///                 Ok(CompletionRequest::new(format!("Write a joke about {topic}")))
///             },
///             |_event, completion| Event::stop(completion.text),
///         )
///         .emits("stop"),
///     )
///     .build()
///     .unwrap();
/// assert_eq!(workflow.step_names(), vec!["joke"]);
/// ```
pub fn completion_step<P, O>(
    name: impl Into<String>,
    provider: Arc<dyn CompletionProvider>,
    accepts: impl Into<String>,
    prompt_fn: P,
    output_fn: O,
) -> StepSpec
where
    P: Fn(&Event) -> FlowResult<CompletionRequest> + Send + Sync + 'static,
    O: Fn(&Event, Completion) -> FlowResult<Event> + Send + Sync + 'static,
{
    StepSpec::new(
        name,
        CompletionStep {
            provider,
            prompt_fn: Box::new(prompt_fn),
            output_fn: Box::new(output_fn),
        },
    )
    .accepts(accepts)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use eventloom_core::prelude::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        error::AgentError,
        provider::{ScriptedProvider, TokenUsage},
        retry::AgentRetryPolicy,
    };

    fn joke_workflow(provider: Arc<ScriptedProvider>) -> Workflow {
        Workflow::builder()
            .name("jokes")
            .step(
                completion_step(
                    "write",
                    provider.clone(),
                    "start",
                    |event| {
                        let topic: String = event.get("topic")?.unwrap_or_default();
                        Ok(CompletionRequest::new(format!("Write a joke about {topic}")))
                    },
                    |_event, completion| {
                        Event::new("joke")
                            .with_field("joke", completion.text)?
                            .with_field("usage", completion.usage)
                    },
                )
                .emits("joke")
                .retry(
                    AgentRetryPolicy::default()
                        .with_initial_delay(Duration::from_millis(1)),
                ),
            )
            .step(
                completion_step(
                    "critique",
                    provider,
                    "joke",
                    |event| {
                        let joke: String = event.get("joke")?.unwrap_or_default();
                        Ok(CompletionRequest::new(format!("Critique this joke: {joke}")))
                    },
                    |_event, completion| Event::stop(completion.text),
                )
                .emits("stop"),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn streams_progress_and_emits_output() {
        let provider = Arc::new(ScriptedProvider::new(["crabs walk sideways", "solid pun"]));
        let mut handle = joke_workflow(provider.clone())
            .run(json!({"topic": "crabs"}))
            .unwrap();
        let events: Vec<Event> = handle.stream_events().unwrap().collect().await;
        let result = handle.await.unwrap();

        assert_eq!(result.result::<String>().unwrap(), Some("solid pun".to_string()));
        let deltas: Vec<Progress> = events
            .iter()
            .filter(|e| e.is::<Progress>())
            .map(|e| e.payload_as().unwrap())
            .collect();
        assert_eq!(deltas.len(), 5);
        assert_eq!(deltas[0].step, "write");
        assert_eq!(deltas[0].delta, "crabs ");
        assert_eq!(deltas[2].index, 2);
        assert_eq!(deltas[3].step, "critique");

        let joke = events.iter().find(|e| e.is_kind("joke")).unwrap();
        let usage: TokenUsage = joke.get("usage").unwrap().unwrap();
        assert_eq!(usage, TokenUsage::new(5, 3));

        let prompts: Vec<String> = provider.requests().into_iter().map(|r| r.prompt).collect();
        assert_eq!(
            prompts,
            vec![
                "Write a joke about crabs",
                "Critique this joke: crabs walk sideways"
            ]
        );
    }

    #[tokio::test]
    async fn retries_transient_provider_errors() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .with_error(AgentError::rate_limit("429"))
                .with_reply("second time lucky")
                .with_reply("fine"),
        );
        let result = joke_workflow(provider.clone())
            .run(json!({"topic": "retries"}))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result.result::<String>().unwrap(), Some("fine".to_string()));
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn permanent_provider_errors_fail_the_run() {
        let provider = Arc::new(
            ScriptedProvider::default().with_error(AgentError::validation("prompt rejected")),
        );
        let err = joke_workflow(provider.clone())
            .run(json!({"topic": "nope"}))
            .unwrap()
            .await
            .unwrap_err();
        match err {
            FlowError::StepFailed {
                step,
                message,
                attempts,
            } => {
                assert_eq!(step, "write");
                assert_eq!(attempts, 1);
                assert!(message.contains("prompt rejected"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
