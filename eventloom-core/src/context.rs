//! Run context: the state store plus the engine's own bookkeeping.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{
    error::{FlowError, Result},
    event::Event,
    state::{StateModel, StateStore},
};

/// An event buffered at a join point, tagged with the invocation that brought it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectedEvent {
    pub invocation: u64,
    pub event: Event,
}

/// A step invocation that was dispatched but had not finished.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingInvocation {
    pub seq: u64,
    pub step: String,
    pub event: Event,
}

/// Serializable image of a [`Context`].
///
/// Restoring a snapshot and taking a new snapshot yields the same value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub state: Map<String, Value>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub collected: BTreeMap<String, Vec<CollectedEvent>>,
    #[serde(default)]
    pub pending: Vec<PendingInvocation>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub in_progress: bool,
}

impl ContextSnapshot {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(FlowError::from)
    }

    /// Parse a snapshot produced by [`ContextSnapshot::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(FlowError::from)
    }
}

#[derive(Debug, Default)]
struct RunBook {
    collected: BTreeMap<String, Vec<CollectedEvent>>,
    pending: BTreeMap<u64, PendingInvocation>,
}

#[derive(Debug, Default)]
struct ContextInner {
    store: StateStore,
    book: Mutex<RunBook>,
    sequence: AtomicU64,
    in_progress: AtomicBool,
    attached: AtomicBool,
}

/// Shared state of one run.
///
/// Cloning is cheap and yields a handle to the same context. A context may be
/// handed from one finished run to the next, but must not back two runs at
/// the same time.
#[derive(Clone, Debug, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context with an empty untyped store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context whose store is bound to the schema of `T`.
    pub fn typed<T: StateModel>() -> Result<Self> {
        Ok(Self::with_store(StateStore::typed::<T>()?))
    }

    /// Create a context around an existing store.
    pub fn with_store(store: StateStore) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                store,
                ..Default::default()
            }),
        }
    }

    /// Start building a context with initial data.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// The user-visible state store.
    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Whether a run using this context has started and not terminated.
    pub fn is_in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    /// Current value of the sequence counter.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Capture the full context.
    pub async fn snapshot(&self) -> ContextSnapshot {
        let state = self.inner.store.to_map().await;
        let book = self.inner.book.lock().await;
        ContextSnapshot {
            state,
            schema: self.inner.store.schema_name().map(str::to_string),
            collected: book.collected.clone(),
            pending: book.pending.values().cloned().collect(),
            sequence: self.sequence(),
            in_progress: self.is_in_progress(),
        }
    }

    /// Rebuild an untyped context from a snapshot.
    pub fn restore(snapshot: ContextSnapshot) -> Result<Self> {
        if let Some(schema) = &snapshot.schema {
            return Err(FlowError::context(format!(
                "snapshot is bound to schema '{schema}', use Context::restore_typed"
            )));
        }
        let store = StateStore::untyped_from(snapshot.state.clone());
        Ok(Self::from_parts(store, snapshot))
    }

    /// Rebuild a context bound to `T` from a snapshot, validating its state.
    pub fn restore_typed<T: StateModel>(snapshot: ContextSnapshot) -> Result<Self> {
        let store = StateStore::typed_from::<T>(snapshot.state.clone())?;
        if store.schema_name() != snapshot.schema.as_deref() {
            return Err(FlowError::context(format!(
                "snapshot schema {:?} does not match {:?}",
                snapshot.schema,
                store.schema_name()
            )));
        }
        Ok(Self::from_parts(store, snapshot))
    }

    fn from_parts(store: StateStore, snapshot: ContextSnapshot) -> Self {
        let pending = snapshot
            .pending
            .into_iter()
            .map(|invocation| (invocation.seq, invocation))
            .collect();
        Self {
            inner: Arc::new(ContextInner {
                store,
                book: Mutex::new(RunBook {
                    collected: snapshot.collected,
                    pending,
                }),
                sequence: AtomicU64::new(snapshot.sequence),
                in_progress: AtomicBool::new(snapshot.in_progress),
                attached: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim the context for a run.
    pub(crate) fn attach(&self) -> Result<()> {
        self.inner
            .attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| FlowError::context("context is already used by a running workflow"))
    }

    pub(crate) fn detach(&self) {
        self.inner.attached.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_in_progress(&self, in_progress: bool) {
        self.inner.in_progress.store(in_progress, Ordering::SeqCst);
    }

    pub(crate) async fn track_pending(&self, seq: u64, step: &str, event: &Event) {
        self.inner.book.lock().await.pending.insert(
            seq,
            PendingInvocation {
                seq,
                step: step.to_string(),
                event: event.clone(),
            },
        );
    }

    pub(crate) async fn finish_pending(&self, seq: u64) {
        self.inner.book.lock().await.pending.remove(&seq);
    }

    /// Drain pending invocations in dispatch order.
    pub(crate) async fn take_pending(&self) -> Vec<PendingInvocation> {
        let mut book = self.inner.book.lock().await;
        std::mem::take(&mut book.pending).into_values().collect()
    }

    /// Buffer `event` at a join point and try to complete the join.
    ///
    /// Returns one event per expected kind, in `expected` order, once every
    /// kind has arrived; those entries are removed from the buffer.
    pub(crate) async fn collect(
        &self,
        join_key: &str,
        invocation: u64,
        event: &Event,
        expected: &[&str],
    ) -> Option<Vec<Event>> {
        let mut book = self.inner.book.lock().await;
        let buffer = book.collected.entry(join_key.to_string()).or_default();
        let seen = buffer
            .iter()
            .any(|c| c.invocation == invocation && c.event == *event);
        if !seen {
            buffer.push(CollectedEvent {
                invocation,
                event: event.clone(),
            });
        }

        let mut used = vec![false; buffer.len()];
        for kind in expected {
            let slot = buffer
                .iter()
                .enumerate()
                .position(|(i, c)| !used[i] && c.event.is_kind(kind))?;
            used[slot] = true;
        }

        let mut picked: Vec<Option<Event>> = vec![None; expected.len()];
        let mut remaining = Vec::with_capacity(buffer.len());
        for (collected, taken) in buffer.drain(..).zip(used) {
            if taken {
                let order = expected
                    .iter()
                    .enumerate()
                    .position(|(i, kind)| picked[i].is_none() && collected.event.is_kind(kind));
                if let Some(i) = order {
                    picked[i] = Some(collected.event);
                    continue;
                }
            }
            remaining.push(collected);
        }
        if remaining.is_empty() {
            book.collected.remove(join_key);
        } else {
            *buffer = remaining;
        }
        picked.into_iter().collect()
    }
}

/// Builder for contexts with initial data.
#[derive(Default)]
pub struct ContextBuilder {
    data: Map<String, Value>,
    bind: Option<fn(Map<String, Value>) -> Result<StateStore>>,
    defaults: Map<String, Value>,
}

impl ContextBuilder {
    /// Create a new context builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key.
    pub fn with_json(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Bind the store to the schema of `T`; seeded keys override its defaults.
    pub fn typed<T: StateModel>(mut self) -> Result<Self> {
        match serde_json::to_value(T::default())? {
            Value::Object(defaults) => self.defaults = defaults,
            other => {
                return Err(FlowError::context(format!(
                    "state must serialize to a JSON object, got {other}"
                )));
            }
        }
        self.bind = Some(StateStore::typed_from::<T>);
        Ok(self)
    }

    /// Build the context, validating seeded data against the schema if bound.
    pub fn build(self) -> Result<Context> {
        let store = match self.bind {
            Some(bind) => {
                let mut data = self.defaults;
                data.extend(self.data);
                bind(data)?
            }
            None => StateStore::untyped_from(self.data),
        };
        Ok(Context::with_store(store))
    }
}
