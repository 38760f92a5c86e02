//! Per-run state store.
//!
//! The store is a JSON object behind an async mutex. It can be bound to a
//! schema derived from a serde struct, in which case every write is
//! validated against that schema before it is committed.

use std::{fmt, sync::Arc};

use schemars::JsonSchema;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{FlowError, Result};

/// A struct usable as typed workflow state.
///
/// Field defaults come from `Default`; the JSON schema from `JsonSchema`.
pub trait StateModel: Serialize + DeserializeOwned + JsonSchema + Default + Send + Sync + 'static {}

impl<T> StateModel for T where
    T: Serialize + DeserializeOwned + JsonSchema + Default + Send + Sync + 'static
{
}

/// Compiled schema a typed store validates against.
pub(crate) struct StateSchema {
    name: String,
    validator: jsonschema::Validator,
}

impl fmt::Debug for StateSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSchema")
            .field("name", &self.name)
            .finish()
    }
}

impl StateSchema {
    fn for_model<T: StateModel>() -> Result<Self> {
        let schema = serde_json::to_value(schemars::schema_for!(T))?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| FlowError::construction(format!("invalid state schema: {e}")))?;
        Ok(Self {
            name: T::schema_name().to_string(),
            validator,
        })
    }

    fn validate(&self, data: &Map<String, Value>) -> Result<()> {
        let instance = Value::Object(data.clone());
        let errors: Vec<String> = self
            .validator
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlowError::validation(format!(
                "{}: {}",
                self.name,
                errors.join("; ")
            )))
        }
    }
}

/// Key/value state shared by every step of a run.
///
/// `get`/`set` take the lock only for the duration of the call, so a
/// read-modify-write built from them can interleave with other steps.
/// Use [`StateStore::edit`] or [`StateStore::edit_state`] for atomic updates.
#[derive(Clone, Debug, Default)]
pub struct StateStore {
    data: Arc<Mutex<Map<String, Value>>>,
    schema: Option<Arc<StateSchema>>,
}

impl StateStore {
    /// Create an empty untyped store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store bound to the schema of `T`, seeded with `T::default()`.
    pub fn typed<T: StateModel>() -> Result<Self> {
        Self::typed_from::<T>(object_of(&T::default())?)
    }

    pub(crate) fn untyped_from(data: Map<String, Value>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            schema: None,
        }
    }

    pub(crate) fn typed_from<T: StateModel>(data: Map<String, Value>) -> Result<Self> {
        let schema = StateSchema::for_model::<T>()?;
        schema.validate(&data)?;
        Ok(Self {
            data: Arc::new(Mutex::new(data)),
            schema: Some(Arc::new(schema)),
        })
    }

    /// Name of the bound schema, if any.
    pub fn schema_name(&self) -> Option<&str> {
        self.schema.as_deref().map(|s| s.name.as_str())
    }

    /// Whether the store validates writes.
    pub fn is_typed(&self) -> bool {
        self.schema.is_some()
    }

    /// Read a value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let data = self.data.lock().await;
        decode(&data, key)
    }

    /// Read a value, falling back to `default` when the key is missing.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Raw JSON value of a key.
    pub async fn get_raw(&self, key: &str) -> Option<Value> {
        self.data.lock().await.get(key).cloned()
    }

    /// Write a value. Last write wins.
    pub async fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let mut data = self.data.lock().await;
        write(&mut data, self.schema.as_deref(), key.into(), value)
    }

    /// Whether the key is present.
    pub async fn contains(&self, key: &str) -> bool {
        self.data.lock().await.contains_key(key)
    }

    /// Acquire exclusive access to the whole store.
    ///
    /// Every other `edit`, `get` and `set` waits until the guard is dropped,
    /// including when the holder returns early with an error.
    pub async fn edit(&self) -> StateGuard<'_> {
        StateGuard {
            data: self.data.lock().await,
            schema: self.schema.as_deref(),
        }
    }

    /// Atomically update the store through a typed view.
    ///
    /// The store is deserialized into `T`, handed to `f`, then validated and
    /// written back. Nothing is written if `f` fails or validation fails.
    pub async fn edit_state<T, R, F>(&self, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let mut data = self.data.lock().await;
        let mut state: T = serde_json::from_value(Value::Object(data.clone()))?;
        let out = f(&mut state)?;
        let updated = object_of(&state)?;
        if let Some(schema) = self.schema.as_deref() {
            schema.validate(&updated)?;
        }
        *data = updated;
        Ok(out)
    }

    /// Read the whole store as `T`.
    pub async fn get_state<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.data.lock().await;
        serde_json::from_value(Value::Object(data.clone())).map_err(FlowError::from)
    }

    /// Copy of the whole store.
    pub async fn to_map(&self) -> Map<String, Value> {
        self.data.lock().await.clone()
    }
}

/// Exclusive handle on a [`StateStore`], released on drop.
pub struct StateGuard<'a> {
    data: MutexGuard<'a, Map<String, Value>>,
    schema: Option<&'a StateSchema>,
}

impl StateGuard<'_> {
    /// Read a value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        decode(&self.data, key)
    }

    /// Read a value, falling back to `default`.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Write a value, validating it against the schema if there is one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        write(&mut self.data, self.schema, key.into(), value)
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        let removed = self.data.remove(key);
        if let Some(schema) = self.schema
            && let Err(e) = schema.validate(&self.data)
        {
            if let Some(value) = removed {
                self.data.insert(key.to_string(), value);
            }
            return Err(e);
        }
        Ok(removed)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// All keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}

fn decode<T: DeserializeOwned>(data: &Map<String, Value>, key: &str) -> Result<Option<T>> {
    data.get(key)
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()
        .map_err(FlowError::from)
}

fn write(
    data: &mut Map<String, Value>,
    schema: Option<&StateSchema>,
    key: String,
    value: impl Serialize,
) -> Result<()> {
    let value = serde_json::to_value(value)?;
    if let Some(schema) = schema {
        let mut candidate = data.clone();
        candidate.insert(key.clone(), value.clone());
        schema.validate(&candidate)?;
    }
    data.insert(key, value);
    Ok(())
}

fn object_of<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(FlowError::context(format!(
            "state must serialize to a JSON object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
    struct CounterState {
        count: i64,
        total_runs: u32,
        messages: Vec<String>,
    }

    #[tokio::test]
    async fn untyped_get_set() {
        let store = StateStore::new();
        assert_eq!(store.get_or("count", 0i64).await.unwrap(), 0);

        store.set("count", 1).await.unwrap();
        store.set("count", 2).await.unwrap();
        assert_eq!(store.get::<i64>("count").await.unwrap(), Some(2));
        assert!(store.contains("count").await);
        assert!(!store.is_typed());
    }

    #[tokio::test]
    async fn guard_serializes_increments() {
        let store = StateStore::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut state = store.edit().await;
                let n: i64 = state.get_or("count", 0).unwrap();
                tokio::task::yield_now().await;
                state.set("count", n + 1).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get::<i64>("count").await.unwrap(), Some(16));
    }

    #[tokio::test]
    async fn guard_released_on_error() {
        let store = StateStore::new();
        let failed: Result<()> = async {
            let _state = store.edit().await;
            Err(FlowError::context("boom"))
        }
        .await;
        assert!(failed.is_err());

        // Would deadlock if the guard leaked.
        store.set("after", true).await.unwrap();
    }

    #[tokio::test]
    async fn typed_store_defaults_and_edit() {
        let store = StateStore::typed::<CounterState>().unwrap();
        assert_eq!(store.schema_name(), Some("CounterState"));
        assert_eq!(
            store.get_state::<CounterState>().await.unwrap(),
            CounterState::default()
        );

        store
            .edit_state(|state: &mut CounterState| {
                state.count += 1;
                state.total_runs += 1;
                state.messages.push(format!("Run #{}", state.total_runs));
                Ok(())
            })
            .await
            .unwrap();

        let state: CounterState = store.get_state().await.unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(state.messages, vec!["Run #1".to_string()]);
    }

    #[tokio::test]
    async fn typed_store_rejects_bad_writes() {
        let store = StateStore::typed::<CounterState>().unwrap();

        let err = store.set("count", "not a number").await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert_eq!(store.get::<i64>("count").await.unwrap(), Some(0));

        let mut guard = store.edit().await;
        assert!(guard.remove("count").is_err());
        assert!(guard.contains("count"));
    }

    #[tokio::test]
    async fn edit_state_discards_on_error() {
        let store = StateStore::typed::<CounterState>().unwrap();
        let result = store
            .edit_state(|state: &mut CounterState| -> Result<()> {
                state.count = 99;
                Err(FlowError::context("abort"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get::<i64>("count").await.unwrap(), Some(0));
    }
}
