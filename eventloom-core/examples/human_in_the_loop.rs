//! Human-in-the-loop: answer in process, then pause, checkpoint and resume.

use eventloom_core::prelude::*;
use futures::StreamExt;

fn greeter() -> Result<Workflow> {
    Workflow::builder()
        .name("greeter")
        .step(
            StepSpec::new(
                "ask",
                step_fn(|_ctx, _event| async move {
                    Ok(Some(Event::input_required("What is your name? ")))
                }),
            )
            .accepts("start")
            .emits_payload::<InputRequired>(),
        )
        .step(
            StepSpec::new(
                "greet",
                step_fn(|ctx, event| async move {
                    let HumanResponse { response } = event.payload_as()?;
                    ctx.set("name", &response).await?;
                    Ok(Some(Event::stop(format!("Hello, {response}!"))?))
                }),
            )
            .accepts_payload::<HumanResponse>()
            .emits("stop"),
        )
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let workflow = greeter()?;

    println!("🙋 In-process answer");
    let mut handle = workflow.run(serde_json::Value::Null)?;
    let mut events = handle.stream_events()?;
    while let Some(event) = events.next().await {
        if let Ok(InputRequired { prefix }) = event.payload_as() {
            println!("{prefix}Ada");
            handle.send(&HumanResponse {
                response: "Ada".into(),
            })?;
        }
    }
    println!("➡️  {}", handle.await?.result::<String>()?.unwrap_or_default());

    println!("\n💾 Checkpoint and resume");
    let mut handle = workflow.run(serde_json::Value::Null)?;
    let mut events = handle.stream_events()?;
    if let Some(event) = events.next().await {
        println!("waiting on: {}", event.kind());
    }
    let checkpoint = handle.context().snapshot().await.to_json()?;
    handle.cancel();
    let _ = handle.await;
    println!("checkpoint: {checkpoint}");

    // Later, possibly in another process.
    let ctx = Context::restore(ContextSnapshot::from_json(&checkpoint)?)?;
    let handle = workflow.run_with_context(ctx, serde_json::Value::Null)?;
    handle.send(&HumanResponse {
        response: "Grace".into(),
    })?;
    println!("➡️  {}", handle.await?.result::<String>()?.unwrap_or_default());
    Ok(())
}
