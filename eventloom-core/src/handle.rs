//! Run handle and event streaming.

use std::{
    fmt,
    future::IntoFuture,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context as TaskContext, Poll},
};

use futures::{Stream, future::BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot, watch,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::{
    context::Context,
    error::{FlowError, Result},
    event::{Event, EventPayload},
    scheduler::LoopMessage,
};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::TimedOut | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Write side of a run's event stream, shared by the run loop and its steps.
///
/// Once closed every further write is dropped, so the consumer sees the
/// stream end after the terminal event even if detached steps keep running.
#[derive(Clone)]
pub(crate) struct StreamWriter {
    tx: Arc<Mutex<Option<UnboundedSender<Event>>>>,
}

impl StreamWriter {
    pub(crate) fn channel() -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub(crate) fn write(&self, event: Event) {
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Events of one run, in the order the run loop saw them.
///
/// Ends after the terminal event.
pub struct EventStream {
    inner: UnboundedReceiverStream<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// Handle on a running workflow.
///
/// Await [`RunHandle::result`] (or the handle itself) for the outcome.
pub struct RunHandle {
    run_id: Uuid,
    context: Context,
    loop_tx: UnboundedSender<LoopMessage>,
    events: Option<UnboundedReceiver<Event>>,
    status: watch::Receiver<RunStatus>,
    result: oneshot::Receiver<Result<Event>>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("status", &self.status())
            .finish()
    }
}

impl RunHandle {
    pub(crate) fn new(
        run_id: Uuid,
        context: Context,
        loop_tx: UnboundedSender<LoopMessage>,
        events: UnboundedReceiver<Event>,
        status: watch::Receiver<RunStatus>,
        result: oneshot::Receiver<Result<Event>>,
    ) -> Self {
        Self {
            run_id,
            context,
            loop_tx,
            events: Some(events),
            status,
            result,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The run's context, e.g. to snapshot it while the run waits for input.
    pub fn context(&self) -> Context {
        self.context.clone()
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub(crate) fn status_receiver(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait_terminal(&self) -> RunStatus {
        let mut status = self.status.clone();
        if status.wait_for(RunStatus::is_terminal).await.is_err() {
            tracing::debug!(run_id = %self.run_id, "run loop dropped before a terminal status");
        }
        *status.borrow()
    }

    /// Take the run's event stream. Only one consumer is allowed.
    pub fn stream_events(&mut self) -> Result<EventStream> {
        self.events
            .take()
            .map(|rx| EventStream {
                inner: UnboundedReceiverStream::new(rx),
            })
            .ok_or_else(|| FlowError::stream("event stream already taken"))
    }

    /// Inject an event from outside, e.g. a `human_response`.
    pub fn send_event(&self, event: Event) -> Result<()> {
        self.loop_tx
            .send(LoopMessage::External(event))
            .map_err(|_| FlowError::stream("run has already finished"))
    }

    /// Inject a typed payload from outside.
    pub fn send<T: EventPayload>(&self, payload: &T) -> Result<()> {
        self.send_event(Event::from_payload(payload)?)
    }

    /// Cancel the run. No effect once it has terminated.
    pub fn cancel(&self) {
        let _ = self.loop_tx.send(LoopMessage::Cancel);
    }

    /// Wait for the outcome: the stop event, or the terminal error.
    pub async fn result(self) -> Result<Event> {
        self.result
            .await
            .unwrap_or_else(|_| Err(FlowError::context("run loop ended without a result")))
    }
}

impl IntoFuture for RunHandle {
    type Output = Result<Event>;
    type IntoFuture = BoxFuture<'static, Result<Event>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result())
    }
}
