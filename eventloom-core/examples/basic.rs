//! Basic usage example of EventLoom: a three-step pipeline with typed events.

use std::sync::Arc;

use eventloom_core::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Processed {
    data: String,
}

impl EventPayload for Processed {
    const KIND: &'static str = "processed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Validated {
    data: String,
    length: usize,
}

impl EventPayload for Validated {
    const KIND: &'static str = "validated";
}

// A step written as a struct instead of a closure
#[derive(Debug)]
struct ProcessStep {
    name: String,
}

#[async_trait]
impl Step for ProcessStep {
    async fn run(&self, ctx: StepContext, event: Arc<Event>) -> Result<Option<Event>> {
        println!("🔄 Processing in step: {}", self.name);

        let input: String = event.get("input")?.unwrap_or_default();
        if input.is_empty() {
            return Err(FlowError::msg("no input provided"));
        }

        ctx.set("processed_by", &self.name).await?;
        Ok(Some(Event::from_payload(&Processed {
            data: format!("Processed by {}: {input}", self.name),
        })?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    println!("🚀 Starting EventLoom Basic Example");

    let workflow = Workflow::builder()
        .name("basic")
        .step(
            StepSpec::new(
                "process",
                ProcessStep {
                    name: "DataProcessor".into(),
                },
            )
            .accepts("start")
            .emits_payload::<Processed>(),
        )
        .step(
            StepSpec::new(
                "validate",
                step_fn(|_ctx, event| async move {
                    println!("✅ Validating");
                    let processed: Processed = event.payload_as()?;
                    let length = processed.data.len();
                    Ok(Some(Event::from_payload(&Validated {
                        data: processed.data,
                        length,
                    })?))
                }),
            )
            .accepts_payload::<Processed>()
            .emits_payload::<Validated>(),
        )
        .step(
            StepSpec::new(
                "finalize",
                step_fn(|ctx, event| async move {
                    println!("🏁 Finalizing workflow");
                    let validated: Validated = event.payload_as()?;
                    let processed_by: String = ctx.get("processed_by", String::new()).await?;
                    Ok(Some(Event::stop(serde_json::json!({
                        "data": validated.data,
                        "length": validated.length,
                        "processed_by": processed_by,
                    }))?))
                }),
            )
            .accepts_payload::<Validated>()
            .emits("stop"),
        )
        .build()?;

    println!("\n🗺️  Workflow graph:\n{}", workflow.draw_all_possible_flows());

    println!("🏃 Executing workflow...");
    let handle = workflow.run(serde_json::json!({"input": "Hello, EventLoom!"}))?;
    let context = handle.context();
    let result = handle.await?;

    println!("\n📊 Workflow Results:");
    println!("Result: {}", result.result::<serde_json::Value>()?.unwrap_or_default());
    println!("State: {:?}", context.store().to_map().await);

    println!("\n✅ Basic example completed successfully!");
    Ok(())
}
