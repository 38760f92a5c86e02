//! Step abstraction for EventLoom workflows.

use std::{fmt, fmt::Debug, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::{
    context::Context,
    error::Result,
    event::{Event, EventPayload},
    handle::StreamWriter,
    resource::ResourceResolver,
    retry::RetryPolicy,
    scheduler::LoopMessage,
    state::StateStore,
    workflow::WorkflowDef,
};

/// Trait for workflow steps.
///
/// A step receives the event that triggered it and may return one follow-up
/// event. Additional events can be emitted through
/// [`StepContext::send_event`]. Returning `Ok(None)` ends the branch.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    async fn run(&self, ctx: StepContext, event: Arc<Event>) -> Result<Option<Event>>;
}

/// Boxed future returned by [`FnStep`] closures.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<Option<Event>>> + Send>>;

/// A step that wraps a closure.
pub struct FnStep<F>
where
    F: Fn(StepContext, Arc<Event>) -> StepFuture + Send + Sync,
{
    func: F,
}

impl<F> Debug for FnStep<F>
where
    F: Fn(StepContext, Arc<Event>) -> StepFuture + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").finish_non_exhaustive()
    }
}

impl<F> FnStep<F>
where
    F: Fn(StepContext, Arc<Event>) -> StepFuture + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(StepContext, Arc<Event>) -> StepFuture + Send + Sync,
{
    async fn run(&self, ctx: StepContext, event: Arc<Event>) -> Result<Option<Event>> {
        (self.func)(ctx, event).await
    }
}

/// Create a step from an async closure.
///
/// ```rust
/// use eventloom_core::prelude::*;
///
/// let step = step_fn(|_ctx, _event| async move { Ok(Some(Event::stop("done")?)) });
/// let spec = StepSpec::new("finish", step).accepts("start").emits("stop");
/// assert_eq!(spec.name(), "finish");
/// ```
#[allow(clippy::type_complexity)]
pub fn step_fn<F, Fut>(
    f: F,
) -> FnStep<impl Fn(StepContext, Arc<Event>) -> StepFuture + Send + Sync>
where
    F: Fn(StepContext, Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Event>>> + Send + 'static,
{
    FnStep::new(move |ctx, event| Box::pin(f(ctx, event)) as StepFuture)
}

/// Declaration of a step: handler plus the events it consumes and produces.
#[derive(Clone)]
pub struct StepSpec {
    pub(crate) name: String,
    pub(crate) handler: Arc<dyn Step>,
    pub(crate) accepts: Vec<String>,
    pub(crate) emits: Vec<String>,
    pub(crate) concurrency: Option<usize>,
    pub(crate) retry: Option<Arc<dyn RetryPolicy>>,
    pub(crate) resources: Vec<String>,
}

impl Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("accepts", &self.accepts)
            .field("emits", &self.emits)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("resources", &self.resources)
            .finish()
    }
}

impl StepSpec {
    pub fn new(name: impl Into<String>, handler: impl Step + 'static) -> Self {
        Self::from_arc(name, Arc::new(handler))
    }

    /// Declare a step around a shared handler.
    pub fn from_arc(name: impl Into<String>, handler: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            handler,
            accepts: Vec::new(),
            emits: Vec::new(),
            concurrency: None,
            retry: None,
            resources: Vec::new(),
        }
    }

    /// Event kind that triggers this step. May be called repeatedly.
    pub fn accepts(mut self, kind: impl Into<String>) -> Self {
        push_unique(&mut self.accepts, kind.into());
        self
    }

    /// Accept events carrying payload `T`.
    pub fn accepts_payload<T: EventPayload>(self) -> Self {
        self.accepts(T::KIND)
    }

    /// Event kind this step may produce. May be called repeatedly.
    pub fn emits(mut self, kind: impl Into<String>) -> Self {
        push_unique(&mut self.emits, kind.into());
        self
    }

    /// Declare that this step produces payload `T`.
    pub fn emits_payload<T: EventPayload>(self) -> Self {
        self.emits(T::KIND)
    }

    /// Maximum number of invocations running at once.
    pub fn concurrency(mut self, width: usize) -> Self {
        self.concurrency = Some(width);
        self
    }

    pub fn retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    /// Declare a resource the step may request.
    pub fn requires(mut self, resource: impl Into<String>) -> Self {
        push_unique(&mut self.resources, resource.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepted_kinds(&self) -> &[String] {
        &self.accepts
    }

    pub fn emitted_kinds(&self) -> &[String] {
        &self.emits
    }

    pub fn required_resources(&self) -> &[String] {
        &self.resources
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Handle a step invocation uses to talk to its run.
#[derive(Clone)]
pub struct StepContext {
    pub(crate) def: Arc<WorkflowDef>,
    pub(crate) run_id: Uuid,
    pub(crate) step: Arc<str>,
    pub(crate) invocation: u64,
    pub(crate) attempt: u32,
    pub(crate) context: Context,
    pub(crate) loop_tx: UnboundedSender<LoopMessage>,
    pub(crate) stream: StreamWriter,
    pub(crate) resources: ResourceResolver,
}

impl Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("step", &self.step)
            .field("invocation", &self.invocation)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl StepContext {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn step_name(&self) -> &str {
        &self.step
    }

    /// 1-based attempt number of this invocation.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The run context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The run's state store.
    pub fn store(&self) -> &StateStore {
        self.context.store()
    }

    /// Emit an event into the run. Ignored once the run has terminated.
    pub fn send_event(&self, event: Event) {
        let _ = self.loop_tx.send(LoopMessage::Emit {
            event,
            target: None,
        });
    }

    /// Emit an event to one named step only.
    ///
    /// Fails if no step has that name or the step does not accept the
    /// event's kind. Stop events are always accepted.
    pub fn send_event_to(&self, step: impl Into<String>, event: Event) -> Result<()> {
        let step = step.into();
        self.def.check_target(&step, event.kind())?;
        let _ = self.loop_tx.send(LoopMessage::Emit {
            event,
            target: Some(step),
        });
        Ok(())
    }

    /// Emit a typed payload into the run.
    pub fn send<T: EventPayload>(&self, payload: &T) -> Result<()> {
        self.send_event(Event::from_payload(payload)?);
        Ok(())
    }

    /// Write an event to the run's stream without dispatching it.
    pub fn write_event_to_stream(&self, event: Event) {
        self.stream.write(event);
    }

    /// Join several events before continuing.
    ///
    /// Buffers `event` and returns `None` until one event of every kind in
    /// `expected` has arrived at this step, then returns them in `expected`
    /// order. A kind listed twice needs two events.
    pub async fn collect_events(&self, event: &Event, expected: &[&str]) -> Option<Vec<Event>> {
        let join_key = format!("{}:{}", self.step, expected.join(","));
        self.context
            .collect(&join_key, self.invocation, event, expected)
            .await
    }

    /// Fetch a resource this step declared with [`StepSpec::requires`].
    pub async fn resource<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.resources.get(name).await
    }

    /// Read a store value, falling back to `default`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        self.store().get_or(key, default).await
    }

    /// Write a store value.
    pub async fn set(&self, key: impl Into<String>, value: impl serde::Serialize) -> Result<()> {
        self.store().set(key, value).await
    }
}

/// Helper functions for common step shapes.
pub mod helpers {
    use super::*;

    /// A step that turns every event it receives into a stop event whose
    /// result is the event payload.
    pub fn finish() -> FnStep<impl Fn(StepContext, Arc<Event>) -> StepFuture + Send + Sync> {
        step_fn(|_ctx, event| async move {
            Ok(Some(Event::stop(serde_json::Value::Object(
                event.payload().clone(),
            ))?))
        })
    }

    /// A step that re-emits its input under another kind.
    pub fn relabel(
        kind: impl Into<String>,
    ) -> FnStep<impl Fn(StepContext, Arc<Event>) -> StepFuture + Send + Sync> {
        let kind: Arc<str> = Arc::from(kind.into());
        step_fn(move |_ctx, event| {
            let kind = Arc::clone(&kind);
            async move { Ok(Some(Event::from_map(&*kind, event.payload().clone()))) }
        })
    }
}
