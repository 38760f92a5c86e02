//! Workflow definition and builder.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use serde_json::Value;

use crate::{
    config::WorkflowConfig,
    context::Context,
    error::{FlowError, Result},
    event::{Event, EventPayload, kinds},
    handle::RunHandle,
    observe::SpanSink,
    resource::{ResourceDef, validate_resources},
    scheduler::{self, Launch},
    state::StateModel,
    step::StepSpec,
};

/// A registered step with its resolved settings.
pub(crate) struct StepEntry {
    pub(crate) name: Arc<str>,
    pub(crate) spec: StepSpec,
    pub(crate) width: usize,
    pub(crate) scope: Arc<Vec<String>>,
}

pub(crate) struct WorkflowDef {
    pub(crate) name: String,
    pub(crate) config: WorkflowConfig,
    pub(crate) steps: Vec<StepEntry>,
    pub(crate) dispatch: HashMap<String, Vec<usize>>,
    pub(crate) start_kind: String,
    pub(crate) stop_kinds: BTreeSet<String>,
    pub(crate) resources: Arc<BTreeMap<String, ResourceDef>>,
    pub(crate) sinks: Vec<Arc<dyn SpanSink>>,
    new_context: fn() -> Result<Context>,
}

impl WorkflowDef {
    pub(crate) fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| &*s.name == name)
    }

    /// Check that `step` exists and accepts `kind`.
    pub(crate) fn check_target(&self, step: &str, kind: &str) -> Result<()> {
        if self.stop_kinds.contains(kind) {
            return Ok(());
        }
        let index = self
            .step_index(step)
            .ok_or_else(|| FlowError::context(format!("no step named '{step}'")))?;
        if self.steps[index].spec.accepts.iter().any(|k| k == kind) {
            Ok(())
        } else {
            Err(FlowError::context(format!(
                "step '{step}' does not accept '{kind}'"
            )))
        }
    }
}

/// An immutable, validated workflow. Cheap to clone; every run is independent.
#[derive(Clone)]
pub struct Workflow {
    def: Arc<WorkflowDef>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.def.name)
            .field("steps", &self.step_names())
            .field("start_kind", &self.def.start_kind)
            .field("stop_kinds", &self.def.stop_kinds)
            .finish()
    }
}

impl Workflow {
    /// Create a new workflow builder.
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.def.config
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.def.steps.iter().map(|s| &*s.name).collect()
    }

    pub(crate) fn steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.def.steps.iter().map(|s| &s.spec)
    }

    pub fn start_kind(&self) -> &str {
        &self.def.start_kind
    }

    pub fn stop_kinds(&self) -> impl Iterator<Item = &str> {
        self.def.stop_kinds.iter().map(String::as_str)
    }

    /// Start a run with a fresh context; `kwargs` becomes the start event payload.
    pub fn run(&self, kwargs: Value) -> Result<RunHandle> {
        let ctx = (self.def.new_context)()?;
        self.run_with_context(ctx, kwargs)
    }

    /// Start a run on an existing context.
    ///
    /// If the context comes from a run that was still in progress (for
    /// instance a restored snapshot), the run resumes: its pending
    /// invocations are re-dispatched and `kwargs` is ignored.
    pub fn run_with_context(&self, ctx: Context, kwargs: Value) -> Result<RunHandle> {
        if ctx.is_in_progress() {
            return scheduler::launch(Arc::clone(&self.def), ctx, Launch::Resume);
        }
        let start = Event::from_value(self.def.start_kind.clone(), kwargs)?;
        scheduler::launch(Arc::clone(&self.def), ctx, Launch::Start(start))
    }

    /// Start a run with an explicit start event and a fresh context.
    pub fn run_with_event(&self, event: Event) -> Result<RunHandle> {
        let ctx = (self.def.new_context)()?;
        self.run_with_context_and_event(ctx, event)
    }

    /// Start a run with an explicit start event on an existing context.
    pub fn run_with_context_and_event(&self, ctx: Context, event: Event) -> Result<RunHandle> {
        if !event.is_kind(&self.def.start_kind) {
            return Err(FlowError::context(format!(
                "workflow '{}' starts on '{}', got '{}'",
                self.def.name,
                self.def.start_kind,
                event.kind()
            )));
        }
        scheduler::launch(Arc::clone(&self.def), ctx, Launch::Start(event))
    }

    /// Graphviz DOT rendering of every step and the events between them.
    pub fn draw_all_possible_flows(&self) -> String {
        crate::draw::draw_all_possible_flows(self)
    }
}

/// Builder for [`Workflow`].
pub struct WorkflowBuilder {
    name: String,
    config: WorkflowConfig,
    steps: Vec<StepSpec>,
    resources: Vec<ResourceDef>,
    start_kind: String,
    stop_kinds: BTreeSet<String>,
    sinks: Vec<Arc<dyn SpanSink>>,
    new_context: fn() -> Result<Context>,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn untyped_context() -> Result<Context> {
    Ok(Context::new())
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self {
            name: "workflow".to_string(),
            config: WorkflowConfig::default(),
            steps: Vec::new(),
            resources: Vec::new(),
            start_kind: kinds::START.to_string(),
            stop_kinds: BTreeSet::from([kinds::STOP.to_string()]),
            sinks: Vec::new(),
            new_context: untyped_context,
        }
    }

    /// Set the workflow name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a step.
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Register a resource steps can declare with [`StepSpec::requires`].
    pub fn resource(mut self, resource: ResourceDef) -> Self {
        self.resources.push(resource);
        self
    }

    /// Use `T::KIND` as the entry event instead of `start`.
    pub fn start_event<T: EventPayload>(mut self) -> Self {
        self.start_kind = T::KIND.to_string();
        self
    }

    /// Treat `T::KIND` as terminal; the event itself becomes the run result.
    pub fn stop_event<T: EventPayload>(mut self) -> Self {
        self.stop_kinds.insert(T::KIND.to_string());
        self
    }

    /// Bind fresh run contexts to the schema of `T`.
    pub fn state<T: StateModel>(mut self) -> Self {
        self.new_context = Context::typed::<T>;
        self
    }

    /// Add an observability sink.
    pub fn sink(mut self, sink: impl SpanSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Validate and build the workflow.
    pub fn build(self) -> Result<Workflow> {
        self.config.validate()?;
        if self.name.trim().is_empty() {
            return Err(FlowError::construction("workflow name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(FlowError::construction("No steps added to workflow"));
        }

        let mut resources = BTreeMap::new();
        for def in self.resources {
            let name = def.name().to_string();
            if resources.insert(name.clone(), def).is_some() {
                return Err(FlowError::construction(format!(
                    "resource '{name}' registered twice"
                )));
            }
        }
        validate_resources(&resources)?;

        let mut steps = Vec::with_capacity(self.steps.len());
        let mut dispatch: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, spec) in self.steps.into_iter().enumerate() {
            if steps.iter().any(|s: &StepEntry| *s.name == *spec.name) {
                return Err(FlowError::construction(format!(
                    "step '{}' registered twice",
                    spec.name
                )));
            }
            if spec.accepts.is_empty() {
                return Err(FlowError::construction(format!(
                    "step '{}' accepts no event kind",
                    spec.name
                )));
            }
            let width = spec.concurrency.unwrap_or(self.config.default_concurrency);
            if width == 0 {
                return Err(FlowError::construction(format!(
                    "step '{}' has concurrency 0",
                    spec.name
                )));
            }
            for resource in &spec.resources {
                if !resources.contains_key(resource) {
                    return Err(FlowError::construction(format!(
                        "step '{}' requires unknown resource '{resource}'",
                        spec.name
                    )));
                }
            }
            for kind in &spec.accepts {
                if self.stop_kinds.contains(kind) {
                    return Err(FlowError::construction(format!(
                        "step '{}' accepts terminal event '{kind}'",
                        spec.name
                    )));
                }
                dispatch.entry(kind.clone()).or_default().push(index);
            }
            steps.push(StepEntry {
                name: Arc::from(spec.name.as_str()),
                scope: Arc::new(spec.resources.clone()),
                width,
                spec,
            });
        }

        let emitted: BTreeSet<&str> = steps
            .iter()
            .flat_map(|s| s.spec.emits.iter().map(String::as_str))
            .collect();

        if !dispatch.contains_key(&self.start_kind) {
            return Err(FlowError::construction(format!(
                "no step accepts the start event '{}'",
                self.start_kind
            )));
        }
        if !emitted.iter().any(|kind| self.stop_kinds.contains(*kind)) {
            return Err(FlowError::construction(
                "no step emits a stop event, the workflow could never complete",
            ));
        }
        for step in &steps {
            for kind in &step.spec.accepts {
                let external = *kind == self.start_kind || kind == kinds::HUMAN_RESPONSE;
                if !external && !emitted.contains(kind.as_str()) {
                    return Err(FlowError::construction(format!(
                        "step '{}' accepts '{kind}' but no step emits it",
                        step.name
                    )));
                }
            }
            for kind in &step.spec.emits {
                let sink_kind = self.stop_kinds.contains(kind) || kind == kinds::INPUT_REQUIRED;
                if !sink_kind && !dispatch.contains_key(kind) {
                    return Err(FlowError::construction(format!(
                        "step '{}' emits '{kind}' but no step accepts it",
                        step.name
                    )));
                }
            }
        }

        Ok(Workflow {
            def: Arc::new(WorkflowDef {
                name: self.name,
                config: self.config,
                steps,
                dispatch,
                start_kind: self.start_kind,
                stop_kinds: self.stop_kinds,
                resources: Arc::new(resources),
                sinks: self.sinks,
                new_context: self.new_context,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::step::{helpers, step_fn};

    #[derive(Serialize, Deserialize)]
    struct Topic {
        topic: String,
    }

    impl EventPayload for Topic {
        const KIND: &'static str = "topic";
    }

    fn noop(name: &str) -> StepSpec {
        StepSpec::new(name, step_fn(|_ctx, _ev| async move { Ok(None) }))
    }

    fn build_err(builder: WorkflowBuilder) -> String {
        match builder.build() {
            Err(FlowError::Construction(msg)) => msg,
            other => panic!("expected construction error, got {other:?}"),
        }
    }

    #[test]
    fn build_requires_steps() {
        assert!(build_err(Workflow::builder()).contains("No steps"));
    }

    #[test]
    fn accepted_kind_must_be_produced() {
        let builder = Workflow::builder()
            .step(noop("a").accepts("start").emits("stop"))
            .step(noop("orphan").accepts("never_emitted").emits("stop"));
        assert!(build_err(builder).contains("no step emits it"));
    }

    #[test]
    fn emitted_kind_must_be_consumed() {
        let builder = Workflow::builder()
            .step(noop("a").accepts("start").emits("stop").emits("dangling"));
        assert!(build_err(builder).contains("no step accepts it"));
    }

    #[test]
    fn needs_entry_and_exit() {
        let no_entry = Workflow::builder().step(noop("a").accepts("other").emits("stop"));
        assert!(build_err(no_entry).contains("start event"));

        let no_exit = Workflow::builder().step(noop("a").accepts("start"));
        assert!(build_err(no_exit).contains("stop event"));
    }

    #[test]
    fn resources_and_widths_are_checked() {
        let unknown = Workflow::builder()
            .step(noop("a").accepts("start").emits("stop").requires("db"));
        assert!(build_err(unknown).contains("unknown resource"));

        let zero = Workflow::builder().step(noop("a").accepts("start").emits("stop").concurrency(0));
        assert!(build_err(zero).contains("concurrency 0"));

        let twice = Workflow::builder()
            .step(noop("a").accepts("start").emits("stop"))
            .step(noop("a").accepts("start").emits("stop"));
        assert!(build_err(twice).contains("registered twice"));
    }

    #[test]
    fn custom_entry_and_exit_kinds() {
        let workflow = Workflow::builder()
            .name("jokes")
            .start_event::<Topic>()
            .step(StepSpec::new("tell", helpers::finish()).accepts_payload::<Topic>().emits("stop"))
            .build()
            .unwrap();

        assert_eq!(workflow.start_kind(), "topic");
        assert_eq!(workflow.step_names(), vec!["tell"]);
        assert!(workflow.run_with_event(Event::new("start")).is_err());
    }

    #[test]
    fn human_response_is_external() {
        let workflow = Workflow::builder()
            .step(noop("ask").accepts("start").emits("input_required"))
            .step(noop("answer").accepts("human_response").emits("stop"))
            .build();
        assert!(workflow.is_ok());
    }
}
