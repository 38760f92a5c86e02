//! Resources: shared per-run dependencies injected into steps.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use eventloom_core::prelude::*;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

#[derive(Debug)]
struct ApiClient {
    base_url: String,
    calls: AtomicU64,
}

impl ApiClient {
    async fn fetch(&self, path: &str) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        format!("{}{path} -> 200 OK", self.base_url)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let workflow = Workflow::builder()
        .name("fetcher")
        .resource(ResourceDef::cached("cache", |_| async {
            Ok(MemoryCache::default())
        }))
        .resource(
            ResourceDef::cached("api", |resolver: ResourceResolver| async move {
                // Factories may use other declared resources.
                let _cache = resolver.get::<MemoryCache>("cache").await?;
                Ok(ApiClient {
                    base_url: "https://api.example.test".into(),
                    calls: AtomicU64::new(0),
                })
            })
            .depends_on(["cache"]),
        )
        .step(
            StepSpec::new(
                "fetch",
                step_fn(|ctx, event| async move {
                    let paths: Vec<String> = event.get("paths")?.unwrap_or_default();
                    let api = ctx.resource::<ApiClient>("api").await?;
                    let cache = ctx.resource::<MemoryCache>("cache").await?;
                    for path in paths.iter().chain(paths.iter()) {
                        let mut entries = cache.entries.lock().await;
                        if !entries.contains_key(path) {
                            entries.insert(path.clone(), api.fetch(path).await);
                        }
                    }
                    Ok(Some(Event::new("fetched").with_field("calls", api.calls.load(Ordering::SeqCst))?))
                }),
            )
            .accepts("start")
            .emits("fetched")
            .requires("api")
            .requires("cache"),
        )
        .step(
            StepSpec::new(
                "report",
                step_fn(|ctx, event| async move {
                    let calls: u64 = event.get("calls")?.unwrap_or_default();
                    let cache = ctx.resource::<MemoryCache>("cache").await?;
                    let cached = cache.entries.lock().await.len();
                    Ok(Some(Event::stop(format!("{calls} API calls, {cached} cached entries"))?))
                }),
            )
            .accepts("fetched")
            .emits("stop")
            .requires("cache"),
        )
        .build()?;

    let result = workflow
        .run(serde_json::json!({"paths": ["/users", "/orders", "/users"]}))?
        .await?;
    println!("📦 {}", result.result::<String>()?.unwrap_or_default());
    Ok(())
}
