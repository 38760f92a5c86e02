//! Resources: named dependencies injected into steps.
//!
//! A resource is built by an async factory. Cached resources are built at
//! most once per run and shared; uncached ones are rebuilt on every request.
//! Factories can request other resources they declared with
//! [`ResourceDef::depends_on`].

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OnceCell};

use crate::error::{FlowError, Result};

type AnyResource = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(ResourceResolver) -> BoxFuture<'static, Result<AnyResource>> + Send + Sync>;

/// Declaration of a resource.
#[derive(Clone)]
pub struct ResourceDef {
    name: String,
    cached: bool,
    depends_on: Vec<String>,
    factory: Factory,
}

impl fmt::Debug for ResourceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDef")
            .field("name", &self.name)
            .field("cached", &self.cached)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl ResourceDef {
    fn from_factory<T, F, Fut>(name: impl Into<String>, cached: bool, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(ResourceResolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let factory: Factory = Arc::new(
            move |resolver: ResourceResolver| -> BoxFuture<'static, Result<AnyResource>> {
                let fut = factory(resolver);
                Box::pin(async move { fut.await.map(|value| Arc::new(value) as AnyResource) })
            },
        );
        Self {
            name: name.into(),
            cached,
            depends_on: Vec::new(),
            factory,
        }
    }

    /// A resource built once per run and shared by every step that asks for it.
    pub fn cached<T, F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(ResourceResolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::from_factory(name, true, factory)
    }

    /// A resource built afresh on every request.
    pub fn uncached<T, F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(ResourceResolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::from_factory(name, false, factory)
    }

    /// A cached resource loaded from a JSON or YAML file, chosen by extension.
    pub fn config_file<T>(name: impl Into<String>, path: impl Into<PathBuf>) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let path: Arc<PathBuf> = Arc::new(path.into());
        Self::cached(name, move |_| {
            let path = Arc::clone(&path);
            async move { load_config::<T>(&path).await }
        })
    }

    /// Declare resources this one is built from.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

async fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        FlowError::resource(format!("cannot read config '{}': {e}", path.display()))
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&text).map_err(FlowError::from),
        Some("yaml" | "yml") => serde_yaml::from_str(&text).map_err(FlowError::from),
        _ => Err(FlowError::resource(format!(
            "unsupported config format: {}",
            path.display()
        ))),
    }
}

/// Check that every dependency exists and the dependency graph is acyclic.
pub(crate) fn validate_resources(defs: &BTreeMap<String, ResourceDef>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        defs: &'a BTreeMap<String, ResourceDef>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                path.push(name);
                return Err(FlowError::construction(format!(
                    "resource dependency cycle: {}",
                    path.join(" -> ")
                )));
            }
            None => {}
        }
        let def = defs.get(name).ok_or_else(|| {
            FlowError::construction(format!(
                "resource '{}' depends on unknown resource '{name}'",
                path.last().copied().unwrap_or("?")
            ))
        })?;
        marks.insert(name, Mark::Visiting);
        path.push(name);
        for dep in &def.depends_on {
            visit(dep, defs, marks, path)?;
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for name in defs.keys() {
        visit(name, defs, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

/// Per-run resource instances.
pub(crate) struct ResourcePool {
    defs: Arc<BTreeMap<String, ResourceDef>>,
    cache: Mutex<HashMap<String, Arc<OnceCell<AnyResource>>>>,
}

impl ResourcePool {
    pub(crate) fn new(defs: Arc<BTreeMap<String, ResourceDef>>) -> Arc<Self> {
        Arc::new(Self {
            defs,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn resolve(self: Arc<Self>, name: String) -> BoxFuture<'static, Result<AnyResource>> {
        Box::pin(async move {
            let def = self
                .defs
                .get(&name)
                .cloned()
                .ok_or_else(|| FlowError::resource(format!("unknown resource '{name}'")))?;
            let resolver = ResourceResolver {
                pool: Arc::clone(&self),
                owner: name.clone(),
                scope: Arc::new(def.depends_on.clone()),
            };
            if !def.cached {
                return (def.factory)(resolver).await;
            }
            let cell = {
                let mut cache = self.cache.lock().await;
                Arc::clone(cache.entry(name.clone()).or_default())
            };
            cell.get_or_try_init(|| (def.factory)(resolver))
                .await
                .cloned()
        })
    }

    /// Resolver restricted to `scope`, handed to a step invocation.
    pub(crate) fn resolver(self: &Arc<Self>, owner: &str, scope: Arc<Vec<String>>) -> ResourceResolver {
        ResourceResolver {
            pool: Arc::clone(self),
            owner: owner.to_string(),
            scope,
        }
    }
}

/// Access to the resources a step or resource factory declared.
#[derive(Clone)]
pub struct ResourceResolver {
    pool: Arc<ResourcePool>,
    owner: String,
    scope: Arc<Vec<String>>,
}

impl fmt::Debug for ResourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceResolver")
            .field("owner", &self.owner)
            .field("scope", &self.scope)
            .finish()
    }
}

impl ResourceResolver {
    /// Fetch a declared resource as `T`.
    pub async fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        if !self.scope.iter().any(|declared| declared == name) {
            return Err(FlowError::resource(format!(
                "'{}' did not declare resource '{name}'",
                self.owner
            )));
        }
        let instance = Arc::clone(&self.pool).resolve(name.to_string()).await?;
        instance.downcast::<T>().map_err(|_| {
            FlowError::resource(format!(
                "resource '{name}' is not a {}",
                std::any::type_name::<T>()
            ))
        })
    }
}
