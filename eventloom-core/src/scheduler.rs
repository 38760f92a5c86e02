//! The run loop.
//!
//! Each run is driven by one task that owns the dispatch bookkeeping. Step
//! invocations run as separate tasks and report back over a single channel,
//! so events from one producer are dispatched in the order they were sent.

use std::{
    any::Any,
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::FutureExt;
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot, watch,
    },
    task::JoinSet,
};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::InFlightPolicy,
    context::Context,
    error::{FlowError, Result},
    event::{Event, EventPayload, WorkflowCancelled, WorkflowFailed, WorkflowTimedOut},
    handle::{RunHandle, RunStatus, StreamWriter},
    observe::StepSpan,
    resource::{ResourcePool, ResourceResolver},
    step::StepContext,
    workflow::WorkflowDef,
};

pub(crate) enum LoopMessage {
    /// Event emitted by a step, optionally addressed to one step.
    Emit { event: Event, target: Option<String> },
    /// Event injected through the run handle.
    External(Event),
    /// An invocation finished, successfully or not.
    Finished {
        seq: u64,
        step: usize,
        outcome: InvocationOutcome,
    },
    Cancel,
}

pub(crate) enum InvocationOutcome {
    Returned(Option<Event>),
    Failed { error: FlowError, attempts: u32 },
}

pub(crate) enum Launch {
    Start(Event),
    Resume,
}

enum Termination {
    Completed(Event),
    Failed {
        step: String,
        error: FlowError,
        attempts: u32,
    },
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct Slot {
    in_flight: usize,
    queue: VecDeque<(u64, Arc<Event>)>,
}

/// Spawn the run loop for `def` on `ctx` and return its handle.
pub(crate) fn launch(def: Arc<WorkflowDef>, ctx: Context, launch: Launch) -> Result<RunHandle> {
    ctx.attach()?;
    let run_id = Uuid::new_v4();
    let (loop_tx, loop_rx) = unbounded_channel();
    let (stream, events) = StreamWriter::channel();
    let (status_tx, status_rx) = watch::channel(RunStatus::Idle);
    let (result_tx, result_rx) = oneshot::channel();

    let span = tracing::info_span!("workflow_run", workflow = %def.name, %run_id);
    let run = RunLoop {
        pool: ResourcePool::new(Arc::clone(&def.resources)),
        slots: def.steps.iter().map(|_| Slot::default()).collect(),
        def,
        ctx: ctx.clone(),
        run_id,
        loop_tx: loop_tx.clone(),
        loop_rx,
        stream,
        status: status_tx,
        tasks: JoinSet::new(),
        started: Instant::now(),
    };
    tokio::spawn(run.drive(launch, result_tx).instrument(span));

    Ok(RunHandle::new(
        run_id, ctx, loop_tx, events, status_rx, result_rx,
    ))
}

struct RunLoop {
    def: Arc<WorkflowDef>,
    ctx: Context,
    run_id: Uuid,
    loop_tx: UnboundedSender<LoopMessage>,
    loop_rx: UnboundedReceiver<LoopMessage>,
    stream: StreamWriter,
    status: watch::Sender<RunStatus>,
    pool: Arc<ResourcePool>,
    slots: Vec<Slot>,
    tasks: JoinSet<()>,
    started: Instant,
}

impl RunLoop {
    async fn drive(mut self, launch: Launch, result_tx: oneshot::Sender<Result<Event>>) {
        self.status.send_replace(RunStatus::Running);
        self.ctx.set_in_progress(true);

        let initial = match launch {
            Launch::Start(event) => {
                info!(start = %event.kind(), "workflow run started");
                self.route(event, None, false).await
            }
            Launch::Resume => {
                let pending = self.ctx.take_pending().await;
                info!(pending = pending.len(), "workflow run resumed");
                for invocation in pending {
                    match self.def.step_index(&invocation.step) {
                        Some(index) => {
                            self.enqueue(index, invocation.seq, Arc::new(invocation.event))
                                .await
                        }
                        None => warn!(step = %invocation.step, "dropping invocation of unknown step"),
                    }
                }
                None
            }
        };

        let timeout = self.def.config.timeout;
        let timer = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        let termination = match initial {
            Some(termination) => termination,
            None => loop {
                tokio::select! {
                    message = self.loop_rx.recv() => {
                        let Some(message) = message else {
                            break Termination::Cancelled;
                        };
                        if let Some(termination) = self.handle(message).await {
                            break termination;
                        }
                    }
                    () = &mut timer => break Termination::TimedOut,
                    Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                        if let Err(e) = joined {
                            error!(error = %e, "step task ended abnormally");
                        }
                    }
                }
            },
        };

        self.finish(termination, result_tx).await;
    }

    async fn handle(&mut self, message: LoopMessage) -> Option<Termination> {
        match message {
            LoopMessage::Emit { event, target } => self.route(event, target, true).await,
            LoopMessage::External(event) => {
                debug!(kind = %event.kind(), "external event received");
                self.route(event, None, false).await
            }
            LoopMessage::Cancel => Some(Termination::Cancelled),
            LoopMessage::Finished { seq, step, outcome } => {
                self.ctx.finish_pending(seq).await;
                let slot = &mut self.slots[step];
                slot.in_flight = slot.in_flight.saturating_sub(1);
                match outcome {
                    InvocationOutcome::Returned(Some(event)) => {
                        if let Some(termination) = self.route(event, None, true).await {
                            return Some(termination);
                        }
                    }
                    InvocationOutcome::Returned(None) => {}
                    InvocationOutcome::Failed { error, attempts } => {
                        return Some(Termination::Failed {
                            step: self.def.steps[step].name.to_string(),
                            error,
                            attempts,
                        });
                    }
                }
                self.pump(step);
                None
            }
        }
    }

    /// Dispatch an event to every step accepting its kind.
    async fn route(
        &mut self,
        event: Event,
        target: Option<String>,
        streamed: bool,
    ) -> Option<Termination> {
        if streamed {
            self.stream.write(event.clone());
        }
        if self.def.stop_kinds.contains(event.kind()) {
            return Some(Termination::Completed(event));
        }

        let def = Arc::clone(&self.def);
        let indices: Vec<usize> = def
            .dispatch
            .get(event.kind())
            .into_iter()
            .flatten()
            .copied()
            .filter(|&i| target.as_deref().is_none_or(|t| &*def.steps[i].name == t))
            .collect();
        if indices.is_empty() {
            debug!(kind = %event.kind(), ?target, "no step accepts event");
            return None;
        }

        let event = Arc::new(event);
        for index in indices {
            let seq = self.ctx.next_sequence();
            self.enqueue(index, seq, Arc::clone(&event)).await;
        }
        None
    }

    async fn enqueue(&mut self, index: usize, seq: u64, event: Arc<Event>) {
        let entry = &self.def.steps[index];
        self.ctx.track_pending(seq, &entry.name, &event).await;
        let width = entry.width;
        let slot = &mut self.slots[index];
        if slot.in_flight < width {
            self.spawn(index, seq, event);
        } else {
            slot.queue.push_back((seq, event));
            debug!(
                step = %self.def.steps[index].name,
                queued = self.slots[index].queue.len(),
                "step saturated, invocation queued"
            );
        }
    }

    /// Start queued invocations while the step has free slots.
    fn pump(&mut self, index: usize) {
        let width = self.def.steps[index].width;
        while self.slots[index].in_flight < width {
            let Some((seq, event)) = self.slots[index].queue.pop_front() else {
                break;
            };
            self.spawn(index, seq, event);
        }
    }

    fn spawn(&mut self, index: usize, seq: u64, event: Arc<Event>) {
        self.slots[index].in_flight += 1;
        let entry = &self.def.steps[index];
        let span = tracing::debug_span!("step", step = %entry.name, seq);
        let invocation = Invocation {
            def: Arc::clone(&self.def),
            index,
            seq,
            event,
            run_id: self.run_id,
            ctx: self.ctx.clone(),
            loop_tx: self.loop_tx.clone(),
            stream: self.stream.clone(),
            resources: self.pool.resolver(&entry.name, Arc::clone(&entry.scope)),
            status: self.status.subscribe(),
        };
        self.tasks.spawn(invocation.run().instrument(span));
    }

    fn active_steps(&self) -> Vec<String> {
        self.def
            .steps
            .iter()
            .zip(&self.slots)
            .filter(|(_, slot)| slot.in_flight > 0 || !slot.queue.is_empty())
            .map(|(entry, _)| entry.name.to_string())
            .collect()
    }

    fn notify<T: EventPayload>(&self, payload: &T) {
        match Event::from_payload(payload) {
            Ok(event) => self.stream.write(event),
            Err(e) => error!(kind = T::KIND, error = %e, "cannot encode notification"),
        }
    }

    async fn finish(mut self, termination: Termination, result_tx: oneshot::Sender<Result<Event>>) {
        let (status, result) = match termination {
            Termination::Completed(event) => (RunStatus::Completed, Ok(event)),
            Termination::Failed {
                step,
                error,
                attempts,
            } => {
                let message = error.to_string();
                self.notify(&WorkflowFailed {
                    step_name: step.clone(),
                    exception_message: message.clone(),
                    attempts,
                });
                (
                    RunStatus::Failed,
                    Err(FlowError::StepFailed {
                        step,
                        message,
                        attempts,
                    }),
                )
            }
            Termination::TimedOut => {
                let timeout = self.def.config.timeout.unwrap_or_default();
                self.notify(&WorkflowTimedOut {
                    timeout: timeout.as_secs_f64(),
                    active_steps: self.active_steps(),
                });
                (RunStatus::TimedOut, Err(FlowError::Timeout(timeout)))
            }
            Termination::Cancelled => {
                self.notify(&WorkflowCancelled {});
                (RunStatus::Cancelled, Err(FlowError::Cancelled))
            }
        };

        self.stream.close();
        self.status.send_replace(status);

        // A cancelled context keeps its pending invocations so it can resume.
        if status != RunStatus::Cancelled {
            self.ctx.set_in_progress(false);
            self.ctx.take_pending().await;
        }

        let queued: usize = self.slots.iter().map(|s| s.queue.len()).sum();
        match self.def.config.in_flight {
            InFlightPolicy::Detach => self.tasks.detach_all(),
            InFlightPolicy::Abort => self.tasks.abort_all(),
            InFlightPolicy::Drain { grace } => {
                let tasks = &mut self.tasks;
                let drained = tokio::time::timeout(grace, async {
                    while tasks.join_next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    warn!(?grace, "in-flight steps still running after grace period, aborting");
                    self.tasks.abort_all();
                }
            }
        }
        self.ctx.detach();

        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match status {
            RunStatus::Completed => info!(%status, elapsed_ms, "workflow run finished"),
            _ => warn!(%status, elapsed_ms, dropped = queued, "workflow run finished"),
        }
        #[cfg(feature = "metrics")]
        metrics::counter!("eventloom_runs_total", "outcome" => status.to_string()).increment(1);

        let _ = result_tx.send(result);
    }
}

/// One dispatched step invocation, including its retries.
struct Invocation {
    def: Arc<WorkflowDef>,
    index: usize,
    seq: u64,
    event: Arc<Event>,
    run_id: Uuid,
    ctx: Context,
    loop_tx: UnboundedSender<LoopMessage>,
    stream: StreamWriter,
    resources: ResourceResolver,
    status: watch::Receiver<RunStatus>,
}

impl Invocation {
    async fn run(mut self) {
        let def = Arc::clone(&self.def);
        let entry = &def.steps[self.index];
        let verbose = def.config.verbose;
        let started = Instant::now();
        let mut attempts = 0u32;

        let outcome = loop {
            attempts += 1;
            let step_ctx = StepContext {
                def: Arc::clone(&def),
                run_id: self.run_id,
                step: Arc::clone(&entry.name),
                invocation: self.seq,
                attempt: attempts,
                context: self.ctx.clone(),
                loop_tx: self.loop_tx.clone(),
                stream: self.stream.clone(),
                resources: self.resources.clone(),
            };
            if verbose {
                info!(attempt = attempts, input = %self.event.kind(), "step started");
            } else {
                debug!(attempt = attempts, input = %self.event.kind(), "step started");
            }

            let started_at = Utc::now();
            let result = AssertUnwindSafe(entry.spec.handler.run(step_ctx, Arc::clone(&self.event)))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(FlowError::msg(format!(
                        "step panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });

            #[cfg(feature = "metrics")]
            metrics::counter!("eventloom_step_invocations_total", "step" => entry.name.to_string())
                .increment(1);

            if !def.sinks.is_empty() {
                let span = StepSpan {
                    run_id: self.run_id,
                    step: entry.name.to_string(),
                    attempt: attempts,
                    started_at,
                    finished_at: Utc::now(),
                    input: (*self.event).clone(),
                    output: result.as_ref().ok().cloned().flatten(),
                    error: result.as_ref().err().map(ToString::to_string),
                };
                for sink in &def.sinks {
                    sink.record(&span);
                }
            }

            let error = match result {
                Ok(output) => {
                    let output_kind = output.as_ref().map(Event::kind).unwrap_or("-");
                    if verbose {
                        info!(attempt = attempts, output = output_kind, "step finished");
                    } else {
                        debug!(attempt = attempts, output = output_kind, "step finished");
                    }
                    break InvocationOutcome::Returned(output);
                }
                Err(error) => error,
            };

            #[cfg(feature = "metrics")]
            metrics::counter!("eventloom_step_failures_total", "step" => entry.name.to_string())
                .increment(1);

            let delay = entry
                .spec
                .retry
                .as_ref()
                .and_then(|policy| policy.next(started.elapsed(), attempts, &error));
            let Some(delay) = delay else {
                error!(attempts, error = %error, "step failed");
                break InvocationOutcome::Failed { error, attempts };
            };

            warn!(attempt = attempts, ?delay, error = %error, "step failed, retrying");
            if !self.wait_before_retry(delay).await {
                debug!("run terminated, abandoning retries");
                return;
            }
        };

        let _ = self.loop_tx.send(LoopMessage::Finished {
            seq: self.seq,
            step: self.index,
            outcome,
        });
    }

    /// Sleep for `delay`; false if the run terminated meanwhile.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        if self.status.borrow().is_terminal() {
            return false;
        }
        let slept = tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = self.status.wait_for(RunStatus::is_terminal) => false,
        };
        slept && !self.status.borrow().is_terminal()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
