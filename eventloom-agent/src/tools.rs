//! Tool executors, the tool registry and the step that runs tool calls.

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use eventloom_core::prelude::{
    Event, EventPayload, HumanResponse, InputRequired, Result as FlowResult, Step, StepContext,
    StepSpec,
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// A request to run one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

impl EventPayload for ToolCall {
    const KIND: &'static str = "tool_call";
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool: tool.into(),
            arguments,
        }
    }
}

/// Result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub call_id: String,
    pub tool: String,
    pub success: bool,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventPayload for ToolOutput {
    const KIND: &'static str = "tool_output";
}

impl ToolOutput {
    pub fn success(call: &ToolCall, content: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            success: true,
            content,
            error: None,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            success: false,
            content: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Given a tool call's arguments, execute the tool and return its result.
#[async_trait]
pub trait ToolExecutor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Whether a human must approve each call before it runs.
    fn requires_confirmation(&self) -> bool {
        false
    }

    async fn execute(&self, arguments: &Value) -> Result<Value>;
}

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A tool backed by an async closure.
pub struct FnToolExecutor {
    name: String,
    description: String,
    requires_confirmation: bool,
    func: Box<ToolFn>,
}

impl fmt::Debug for FnToolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnToolExecutor")
            .field("name", &self.name)
            .field("requires_confirmation", &self.requires_confirmation)
            .finish_non_exhaustive()
    }
}

impl FnToolExecutor {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            requires_confirmation: false,
            func: Box::new(move |arguments| Box::pin(func(arguments))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_confirmation(mut self, required: bool) -> Self {
        self.requires_confirmation = required;
        self
    }
}

#[async_trait]
impl ToolExecutor for FnToolExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }

    async fn execute(&self, arguments: &Value) -> Result<Value> {
        (self.func)(arguments.clone()).await
    }
}

/// Tools by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name.
    pub fn register(&mut self, tool: impl ToolExecutor + 'static) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(AgentError::configuration(format!(
                "tool '{name}' already registered"
            )));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    /// Builder form of [`ToolRegistry::register`].
    pub fn with_tool(mut self, tool: impl ToolExecutor + 'static) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .is_some_and(|tool| tool.requires_confirmation())
    }

    /// Run `call` against its tool.
    ///
    /// Unknown tools and transient errors are returned as errors so the
    /// step fails or retries. Any other tool error becomes an unsuccessful
    /// [`ToolOutput`] the workflow can react to.
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolOutput> {
        let tool = self
            .get(&call.tool)
            .ok_or_else(|| AgentError::unknown_tool(call.tool.clone()))?;
        match tool.execute(&call.arguments).await {
            Ok(content) => Ok(ToolOutput::success(call, content)),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                warn!(tool = %call.tool, call_id = %call.id, error = %e, "tool call failed");
                Ok(ToolOutput::failure(call, e.to_string()))
            }
        }
    }
}

#[derive(Debug)]
struct ToolStep {
    registry: Arc<ToolRegistry>,
}

fn awaiting_key(step: &str) -> String {
    format!("{step}.awaiting_confirmation")
}

fn approved(response: &str) -> bool {
    matches!(
        response.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    )
}

impl ToolStep {
    async fn run_call(&self, call: &ToolCall) -> FlowResult<Option<Event>> {
        let output = self.registry.execute(call).await?;
        info!(tool = %call.tool, call_id = %call.id, success = output.success, "tool call finished");
        Ok(Some(Event::from_payload(&output)?))
    }

    async fn on_call(&self, ctx: &StepContext, call: ToolCall) -> FlowResult<Option<Event>> {
        if !self.registry.requires_confirmation(&call.tool) {
            return self.run_call(&call).await;
        }

        let key = awaiting_key(ctx.step_name());
        {
            let mut state = ctx.store().edit().await;
            let mut waiting: Vec<ToolCall> = state.get_or(&key, Vec::new())?;
            waiting.push(call.clone());
            state.set(key, waiting)?;
        }
        info!(tool = %call.tool, call_id = %call.id, "tool call awaiting confirmation");
        let prompt = InputRequired {
            prefix: format!(
                "Allow tool '{}' with arguments {}? [y/N] ",
                call.tool, call.arguments
            ),
        };
        Ok(Some(
            Event::from_payload(&prompt)?.with_field("call_id", &call.id)?,
        ))
    }

    async fn on_response(
        &self,
        ctx: &StepContext,
        response: HumanResponse,
    ) -> FlowResult<Option<Event>> {
        let key = awaiting_key(ctx.step_name());
        let call = {
            let mut state = ctx.store().edit().await;
            let mut waiting: Vec<ToolCall> = state.get_or(&key, Vec::new())?;
            if waiting.is_empty() {
                return Ok(None);
            }
            let call = waiting.remove(0);
            if waiting.is_empty() {
                state.remove(&key)?;
            } else {
                state.set(key, waiting)?;
            }
            call
        };

        if approved(&response.response) {
            self.run_call(&call).await
        } else {
            info!(tool = %call.tool, call_id = %call.id, "tool call denied");
            Ok(Some(Event::from_payload(&ToolOutput::failure(
                &call,
                "denied by user",
            ))?))
        }
    }
}

#[async_trait]
impl Step for ToolStep {
    async fn run(&self, ctx: StepContext, event: Arc<Event>) -> FlowResult<Option<Event>> {
        if event.is::<ToolCall>() {
            self.on_call(&ctx, event.payload_as()?).await
        } else if event.is::<HumanResponse>() {
            self.on_response(&ctx, event.payload_as()?).await
        } else {
            Ok(None)
        }
    }
}

/// Declare a step that executes `tool_call` events.
///
/// Calls to tools that require confirmation are parked in the run's state
/// store and answered with an `input_required` event; the next
/// `human_response` ("y" or "yes" approves) releases the oldest parked call.
/// Parked calls are part of the context snapshot, so a paused run can be
/// resumed elsewhere. The step emits a `tool_output` for every call.
pub fn tool_step(name: impl Into<String>, registry: Arc<ToolRegistry>) -> StepSpec {
    StepSpec::new(name, ToolStep { registry })
        .accepts_payload::<ToolCall>()
        .accepts_payload::<HumanResponse>()
        .emits_payload::<ToolOutput>()
        .emits_payload::<InputRequired>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use eventloom_core::prelude::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn calculator() -> FnToolExecutor {
        FnToolExecutor::new("add", |arguments: Value| async move {
            let a = arguments["a"].as_i64().ok_or_else(|| AgentError::validation("a"))?;
            let b = arguments["b"].as_i64().ok_or_else(|| AgentError::validation("b"))?;
            Ok(json!(a + b))
        })
        .with_description("Add two integers")
    }

    fn delete_file(deleted: Arc<AtomicUsize>) -> FnToolExecutor {
        FnToolExecutor::new("delete_file", move |arguments: Value| {
            let deleted = Arc::clone(&deleted);
            async move {
                deleted.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"deleted": arguments["path"]}))
            }
        })
        .with_confirmation(true)
    }

    fn agent(registry: ToolRegistry) -> Workflow {
        Workflow::builder()
            .name("agent")
            .step(
                StepSpec::new(
                    "plan",
                    step_fn(|_ctx, event| async move {
                        let tool: String = event.get("tool")?.unwrap_or_default();
                        let arguments: Value = event.get("arguments")?.unwrap_or_default();
                        Ok(Some(Event::from_payload(&ToolCall::new(tool, arguments))?))
                    }),
                )
                .accepts("start")
                .emits_payload::<ToolCall>(),
            )
            .step(tool_step("tools", Arc::new(registry)))
            .step(
                StepSpec::new(
                    "report",
                    step_fn(|_ctx, event| async move {
                        let output: ToolOutput = event.payload_as()?;
                        Ok(Some(Event::stop(output)?))
                    }),
                )
                .accepts_payload::<ToolOutput>()
                .emits("stop"),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn registry_lists_and_rejects_duplicates() {
        let mut registry = ToolRegistry::new();
        registry.register(calculator()).unwrap();
        assert!(registry.register(calculator()).is_err());
        assert_eq!(registry.list(), vec!["add"]);
        assert_eq!(registry.get("add").unwrap().description(), "Add two integers");
        assert!(!registry.requires_confirmation("add"));

        let call = ToolCall::new("add", json!({"a": 2, "b": 3}));
        let output = registry.execute(&call).await.unwrap();
        assert_eq!(output, ToolOutput::success(&call, json!(5)));

        let bad = ToolCall::new("add", json!({"a": 2}));
        let output = registry.execute(&bad).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.error.as_deref(), Some("invalid input: b"));

        let missing = ToolCall::new("multiply", json!({}));
        assert_eq!(
            registry.execute(&missing).await.unwrap_err().category(),
            "unknown_tool"
        );
    }

    #[tokio::test]
    async fn runs_tools_without_confirmation() {
        let registry = ToolRegistry::new().with_tool(calculator()).unwrap();
        let result = agent(registry)
            .run(json!({"tool": "add", "arguments": {"a": 40, "b": 2}}))
            .unwrap()
            .await
            .unwrap();
        let output: ToolOutput = result.result().unwrap().unwrap();
        assert!(output.success);
        assert_eq!(output.content, json!(42));
    }

    async fn answer_confirmation(answer: &str, deleted: Arc<AtomicUsize>) -> ToolOutput {
        let registry = ToolRegistry::new().with_tool(delete_file(deleted)).unwrap();
        let mut handle = agent(registry)
            .run(json!({"tool": "delete_file", "arguments": {"path": "/tmp/x"}}))
            .unwrap();
        let mut events = handle.stream_events().unwrap();
        while let Some(event) = events.next().await {
            if event.is::<InputRequired>() {
                let prompt: InputRequired = event.payload_as().unwrap();
                assert!(prompt.prefix.contains("delete_file"));
                assert!(event.get::<String>("call_id").unwrap().is_some());
                handle.send_event(Event::human_response(answer)).unwrap();
            }
        }
        handle.await.unwrap().result().unwrap().unwrap()
    }

    #[tokio::test]
    async fn confirmed_calls_run() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let output = answer_confirmation(" Yes ", Arc::clone(&deleted)).await;
        assert!(output.success);
        assert_eq!(output.content, json!({"deleted": "/tmp/x"}));
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_calls_do_not_run() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let output = answer_confirmation("no", Arc::clone(&deleted)).await;
        assert!(!output.success);
        assert_eq!(output.error.as_deref(), Some("denied by user"));
        assert_eq!(deleted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parked_call_survives_snapshot() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new()
            .with_tool(delete_file(Arc::clone(&deleted)))
            .unwrap();
        let workflow = agent(registry);

        let mut handle = workflow
            .run(json!({"tool": "delete_file", "arguments": {"path": "/tmp/y"}}))
            .unwrap();
        let mut events = handle.stream_events().unwrap();
        while let Some(event) = events.next().await {
            if event.is::<InputRequired>() {
                break;
            }
        }
        let snapshot = handle.context().snapshot().await;
        assert!(snapshot.state.contains_key("tools.awaiting_confirmation"));
        handle.cancel();
        let _ = handle.await;

        let ctx = Context::restore(snapshot).unwrap();
        let handle = workflow.run_with_context(ctx.clone(), json!({})).unwrap();
        handle.send_event(Event::human_response("y")).unwrap();
        let output: ToolOutput = handle.await.unwrap().result().unwrap().unwrap();

        assert!(output.success);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert!(!ctx.store().contains("tools.awaiting_confirmation").await);
    }
}
