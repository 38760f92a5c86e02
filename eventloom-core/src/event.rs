//! Events, the unit of workflow control flow.
//!
//! An [`Event`] is a kind discriminant plus a payload of named JSON fields.
//! Steps receive events behind an `Arc` and never mutate them.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};

/// Reserved event kinds.
pub mod kinds {
    /// Entry event of a run, carries the run arguments.
    pub const START: &str = "start";
    /// Terminal event of a run, carries the result under `result`.
    pub const STOP: &str = "stop";
    /// A step asks a human for input.
    pub const INPUT_REQUIRED: &str = "input_required";
    /// A human answers an `input_required` event.
    pub const HUMAN_RESPONSE: &str = "human_response";
    /// Streamed when a step fails fatally.
    pub const WORKFLOW_FAILED: &str = "workflow_failed";
    /// Streamed when the global timeout expires.
    pub const WORKFLOW_TIMED_OUT: &str = "workflow_timed_out";
    /// Streamed when the run is cancelled.
    pub const WORKFLOW_CANCELLED: &str = "workflow_cancelled";
}

/// A typed event payload.
///
/// The payload must serialize to a JSON object.
///
/// ```rust
/// use eventloom_core::prelude::*;
///
/// #[derive(Serialize, Deserialize)]
/// struct JokeEvent {
///     joke: String,
/// }
///
/// impl EventPayload for JokeEvent {
///     const KIND: &'static str = "joke";
/// }
///
/// let event = Event::from_payload(&JokeEvent { joke: "...".into() }).unwrap();
/// assert!(event.is::<JokeEvent>());
/// ```
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event kind this payload is carried under.
    const KIND: &'static str;
}

/// Immutable workflow event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: String,
    #[serde(default)]
    payload: Map<String, Value>,
}

impl Event {
    /// Create an event with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Create an event from an existing field map.
    pub fn from_map(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Create an event from a JSON value, which must be an object or null.
    pub fn from_value(kind: impl Into<String>, value: Value) -> Result<Self> {
        Ok(Self::from_map(kind, object_from_value(value)?))
    }

    /// Create an event from a typed payload.
    pub fn from_payload<T: EventPayload>(payload: &T) -> Result<Self> {
        Self::from_value(T::KIND, serde_json::to_value(payload)?)
    }

    /// Add a field while constructing the event.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.payload.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Default start event carrying the run arguments.
    pub fn start(args: Value) -> Result<Self> {
        Self::from_value(kinds::START, args)
    }

    /// Default stop event carrying `result`.
    pub fn stop(result: impl Serialize) -> Result<Self> {
        Self::new(kinds::STOP).with_field("result", result)
    }

    /// Ask a human for input; `prefix` is the prompt shown to them.
    pub fn input_required(prefix: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("prefix".to_string(), Value::String(prefix.into()));
        Self::from_map(kinds::INPUT_REQUIRED, payload)
    }

    /// A human's answer to an `input_required` event.
    pub fn human_response(response: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("response".to_string(), Value::String(response.into()));
        Self::from_map(kinds::HUMAN_RESPONSE, payload)
    }

    /// The event kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether the event has the given kind.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Whether the event carries payload type `T`.
    pub fn is<T: EventPayload>(&self) -> bool {
        self.kind == T::KIND
    }

    /// All payload fields.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Raw value of a payload field.
    pub fn get_raw(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Deserialize a single payload field.
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>> {
        self.payload
            .get(field)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(FlowError::from)
    }

    /// The `result` field of a stop event.
    pub fn result<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.get("result")
    }

    /// Deserialize the whole payload into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(FlowError::from)
    }

    /// Deserialize the payload into `T`, checking the kind first.
    pub fn payload_as<T: EventPayload>(&self) -> Result<T> {
        if !self.is::<T>() {
            return Err(FlowError::context(format!(
                "expected event '{}', got '{}'",
                T::KIND,
                self.kind
            )));
        }
        self.parse()
    }
}

pub(crate) fn object_from_value(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(FlowError::context(format!(
            "event payload must be a JSON object, got {other}"
        ))),
    }
}

/// Payload of an `input_required` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequired {
    /// Prompt shown to the human.
    pub prefix: String,
}

impl EventPayload for InputRequired {
    const KIND: &'static str = kinds::INPUT_REQUIRED;
}

/// Payload of a `human_response` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanResponse {
    /// The human's answer.
    pub response: String,
}

impl EventPayload for HumanResponse {
    const KIND: &'static str = kinds::HUMAN_RESPONSE;
}

/// Payload of the `workflow_failed` stream notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailed {
    pub step_name: String,
    pub exception_message: String,
    pub attempts: u32,
}

impl EventPayload for WorkflowFailed {
    const KIND: &'static str = kinds::WORKFLOW_FAILED;
}

/// Payload of the `workflow_timed_out` stream notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTimedOut {
    /// Configured timeout in seconds.
    pub timeout: f64,
    /// Steps that still had invocations in flight.
    pub active_steps: Vec<String>,
}

impl EventPayload for WorkflowTimedOut {
    const KIND: &'static str = kinds::WORKFLOW_TIMED_OUT;
}

/// Payload of the `workflow_cancelled` stream notification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCancelled {}

impl EventPayload for WorkflowCancelled {
    const KIND: &'static str = kinds::WORKFLOW_CANCELLED;
}
