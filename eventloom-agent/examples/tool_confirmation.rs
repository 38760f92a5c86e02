//! Tool calls gated by human confirmation, answered from stdin.

use std::sync::Arc;

use eventloom_agent::prelude::*;
use eventloom_core::prelude::{
    Event, EventPayload, HumanResponse, InputRequired, StepSpec, Workflow, step_fn,
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> eventloom_core::prelude::Result<()> {
    tracing_subscriber::fmt::init();

    let registry = ToolRegistry::new()
        .with_tool(
            FnToolExecutor::new("get_weather", |arguments: Value| async move {
                let city = arguments["city"].as_str().unwrap_or("nowhere").to_string();
                Ok(json!({"city": city, "forecast": "sunny", "celsius": 21}))
            })
            .with_description("Look up the weather for a city"),
        )?
        .with_tool(
            FnToolExecutor::new("send_email", |arguments: Value| async move {
                Ok(json!({"sent_to": arguments["to"], "status": "queued"}))
            })
            .with_description("Send an email")
            .with_confirmation(true),
        )?;

    let workflow = Workflow::builder()
        .name("assistant")
        .step(
            StepSpec::new(
                "plan",
                step_fn(|ctx, _event| async move {
                    ctx.send(&ToolCall::new("get_weather", json!({"city": "Lisbon"})))?;
                    ctx.send(&ToolCall::new(
                        "send_email",
                        json!({"to": "team@example.test", "body": "Sunny in Lisbon"}),
                    ))?;
                    Ok(None)
                }),
            )
            .accepts("start")
            .emits_payload::<ToolCall>(),
        )
        .step(tool_step("tools", Arc::new(registry)))
        .step(
            StepSpec::new(
                "summarize",
                step_fn(|ctx, event| async move {
                    let Some(outputs) = ctx
                        .collect_events(&event, &[ToolOutput::KIND, ToolOutput::KIND])
                        .await
                    else {
                        return Ok(None);
                    };
                    let outputs = outputs
                        .iter()
                        .map(Event::payload_as::<ToolOutput>)
                        .collect::<eventloom_core::prelude::Result<Vec<_>>>()?;
                    Ok(Some(Event::stop(outputs)?))
                }),
            )
            .accepts_payload::<ToolOutput>()
            .emits("stop"),
        )
        .build()?;

    let mut handle = workflow.run(Value::Null)?;
    let mut events = handle.stream_events()?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(event) = events.next().await {
        if let Ok(InputRequired { prefix }) = event.payload_as() {
            println!("{prefix}");
            let response = stdin.next_line().await?.unwrap_or_default();
            handle.send(&HumanResponse { response })?;
        }
    }

    let outputs: Vec<ToolOutput> = handle.await?.result()?.unwrap_or_default();
    for output in outputs {
        match output.error {
            None => println!("✅ {}: {}", output.tool, output.content),
            Some(error) => println!("⛔ {}: {error}", output.tool),
        }
    }
    Ok(())
}
