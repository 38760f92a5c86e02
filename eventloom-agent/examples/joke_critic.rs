//! Write a joke, then critique it, streaming the model output as it arrives.
//!
//! Uses a scripted provider; swap in any `CompletionProvider` implementation.

use std::{io::Write, sync::Arc, time::Duration};

use eventloom_agent::prelude::*;
use eventloom_core::prelude::{Event, Workflow, WorkflowConfig};
use futures::StreamExt;

#[tokio::main]
async fn main() -> eventloom_core::prelude::Result<()> {
    tracing_subscriber::fmt::init();
    println!("🤖 Starting EventLoom Joke Critic");

    let provider = Arc::new(
        ScriptedProvider::new([
            "Why do Rust programmers never get lost? They always follow the borrow checker.",
            "Decent pun on guidance, predictable punchline. 6/10.",
        ])
        .with_delta_delay(Duration::from_millis(40)),
    );

    let workflow = Workflow::builder()
        .name("joke_critic")
        .step(
            completion_step(
                "write_joke",
                provider.clone(),
                "start",
                |event| {
                    let topic: String = event.get("topic")?.unwrap_or_else(|| "rust".into());
                    Ok(CompletionRequest::new(format!("Write your best joke about {topic}."))
                        .with_temperature(0.9))
                },
                |_event, completion| Event::new("joke").with_field("joke", completion.text),
            )
            .emits("joke")
            .retry(AgentRetryPolicy::default()),
        )
        .step(
            completion_step(
                "critique_joke",
                provider.clone(),
                "joke",
                |event| {
                    let joke: String = event.get("joke")?.unwrap_or_default();
                    Ok(CompletionRequest::new(format!(
                        "Give a thorough analysis and critique of the following joke: {joke}"
                    )))
                },
                |_event, completion| Event::stop(completion.text),
            )
            .emits("stop")
            .retry(AgentRetryPolicy::default()),
        )
        .config(WorkflowConfig::default().with_timeout(Duration::from_secs(30)))
        .build()?;

    let mut handle = workflow.run(serde_json::json!({"topic": "pirates"}))?;
    let mut events = handle.stream_events()?;
    let mut current = String::new();
    while let Some(event) = events.next().await {
        if let Ok(progress) = event.payload_as::<Progress>() {
            if progress.step != current {
                print!("\n\n📝 {}: ", progress.step);
                current = progress.step;
            }
            print!("{}", progress.delta);
            let _ = std::io::stdout().flush();
        }
    }

    let critique = handle.await?;
    println!(
        "\n\n✅ Final critique: {}",
        critique.result::<String>()?.unwrap_or_default()
    );
    println!("📊 Provider calls: {}", provider.requests().len());
    Ok(())
}
