//! Completion providers: the narrow interface to a language model.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// A prompt sent to a provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A finished completion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// One item of a streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamChunk {
    /// A text delta.
    Token(String),
    /// Token usage, usually sent once after the last delta.
    Usage(TokenUsage),
}

/// Stream of completion chunks.
pub type DeltaStream = BoxStream<'static, Result<StreamChunk>>;

/// Given a prompt, produce a completion, optionally as a stream of deltas.
#[async_trait]
pub trait CompletionProvider: Send + Sync + Debug {
    /// Provider name, used in logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Stream the completion as text deltas.
    ///
    /// The default implementation yields the whole completion as one delta,
    /// followed by its usage when the provider reported one.
    async fn stream_complete(&self, request: &CompletionRequest) -> Result<DeltaStream> {
        let completion = self.complete(request).await?;
        let chunks = std::iter::once(StreamChunk::Token(completion.text))
            .chain(completion.usage.map(StreamChunk::Usage))
            .map(Ok::<_, AgentError>);
        Ok(stream::iter(chunks).boxed())
    }
}

/// A provider that replays canned replies, for tests and demos.
///
/// Replies are consumed in order; an exhausted script is a configuration
/// error. Every request is recorded.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    replies: Arc<Mutex<VecDeque<Result<String>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    delta_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::default();
        for reply in replies {
            provider.push(Ok(reply.into()));
        }
        provider
    }

    /// Queue a reply.
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push(Ok(reply.into()));
        self
    }

    /// Queue a failure.
    pub fn with_error(self, error: AgentError) -> Self {
        self.push(Err(error));
        self
    }

    /// Pause between streamed deltas.
    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = Some(delay);
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn push(&self, reply: Result<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
    }

    fn next_reply(&self, request: &CompletionRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                Err(AgentError::configuration(
                    "scripted provider has no replies left",
                ))
            })
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let text = self.next_reply(request)?;
        let usage = word_usage(request, &text);
        Ok(Completion {
            text,
            usage: Some(usage),
        })
    }

    /// Streams the reply word by word, then its usage.
    async fn stream_complete(&self, request: &CompletionRequest) -> Result<DeltaStream> {
        let text = self.next_reply(request)?;
        let usage = word_usage(request, &text);
        let deltas: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
        let delay = self.delta_delay;
        let tokens = stream::iter(deltas).then(move |delta| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, AgentError>(StreamChunk::Token(delta))
        });
        Ok(tokens
            .chain(stream::once(async move { Ok(StreamChunk::Usage(usage)) }))
            .boxed())
    }
}

fn word_usage(request: &CompletionRequest, text: &str) -> TokenUsage {
    TokenUsage::new(
        request.prompt.split_whitespace().count(),
        text.split_whitespace().count(),
    )
}
