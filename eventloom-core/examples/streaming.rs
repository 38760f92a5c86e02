//! Stream progress and intermediate events while a run executes.

use std::time::Duration;

use eventloom_core::prelude::*;
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let workflow = Workflow::builder()
        .name("writer")
        .step(
            StepSpec::new(
                "draft",
                step_fn(|ctx, event| async move {
                    let topic: String = event.get("topic")?.unwrap_or_else(|| "rust".into());
                    let mut draft = String::new();
                    for word in ["Ownership", "makes", topic.as_str(), "fearless."] {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        draft.push_str(word);
                        draft.push(' ');
                        ctx.write_event_to_stream(Event::new("progress").with_field("delta", word)?);
                    }
                    Ok(Some(Event::new("draft").with_field("text", draft.trim_end())?))
                }),
            )
            .accepts("start")
            .emits("draft"),
        )
        .step(
            StepSpec::new(
                "review",
                step_fn(|_ctx, event| async move {
                    let text: String = event.get("text")?.unwrap_or_default();
                    Ok(Some(Event::stop(format!("{text} (reviewed)"))?))
                }),
            )
            .accepts("draft")
            .emits("stop"),
        )
        .config(WorkflowConfig::default().with_env_overrides()?)
        .build()?;

    let mut handle = workflow.run(serde_json::json!({"topic": "concurrency"}))?;
    let mut events = handle.stream_events()?;
    while let Some(event) = events.next().await {
        match event.kind() {
            "progress" => println!("✍️  {}", event.get::<String>("delta")?.unwrap_or_default()),
            kind => println!("📨 {kind}"),
        }
    }

    match handle.await {
        Ok(result) => println!("✅ {}", result.result::<String>()?.unwrap_or_default()),
        Err(e) => println!("❌ {e}"),
    }
    Ok(())
}
