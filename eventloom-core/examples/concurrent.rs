//! Fan-out/fan-in with bounded concurrency and retries.

use std::time::Duration;

use eventloom_core::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Query {
    query: String,
}

impl EventPayload for Query {
    const KIND: &'static str = "query";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Answer {
    query: String,
    answer: String,
}

impl EventPayload for Answer {
    const KIND: &'static str = "answer";
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    println!("🚀 Starting EventLoom Concurrent Example");

    let queries = ["rust ownership", "tokio select", "serde derive", "tracing spans"];
    let expected = vec![Answer::KIND; queries.len()];

    let workflow = Workflow::builder()
        .name("research")
        .step(
            StepSpec::new(
                "dispatch",
                step_fn(|ctx, event| async move {
                    let queries: Vec<String> = event.get("queries")?.unwrap_or_default();
                    ctx.set("query_count", queries.len()).await?;
                    for query in queries {
                        ctx.send(&Query { query })?;
                    }
                    Ok(None)
                }),
            )
            .accepts("start")
            .emits_payload::<Query>(),
        )
        .step(
            StepSpec::new(
                "search",
                step_fn(|ctx, event| async move {
                    let Query { query } = event.payload_as()?;
                    // Flaky backend: first attempt sometimes fails.
                    if ctx.attempt() == 1 && fastrand::bool() {
                        return Err(FlowError::msg(format!("search for '{query}' timed out")));
                    }
                    tokio::time::sleep(Duration::from_millis(fastrand::u64(50..200))).await;
                    println!("🔎 answered '{query}' on attempt {}", ctx.attempt());
                    Ok(Some(Event::from_payload(&Answer {
                        answer: format!("{} characters of wisdom", query.len() * 10),
                        query,
                    })?))
                }),
            )
            .accepts_payload::<Query>()
            .emits_payload::<Answer>()
            .concurrency(2)
            .retry(
                ExponentialBackoffRetryPolicy::default()
                    .with_initial_delay(Duration::from_millis(20))
                    .with_maximum_attempts(4),
            ),
        )
        .step(
            StepSpec::new(
                "combine",
                step_fn(move |ctx, event| {
                    let expected = expected.clone();
                    async move {
                        let Some(answers) = ctx.collect_events(&event, &expected).await else {
                            return Ok(None);
                        };
                        let answers = answers
                            .iter()
                            .map(Event::payload_as::<Answer>)
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Some(Event::stop(answers.len())?))
                    }
                }),
            )
            .accepts_payload::<Answer>()
            .emits("stop"),
        )
        .config(WorkflowConfig::default().with_timeout(Duration::from_secs(10)))
        .sink(TracingSink)
        .build()?;

    let result = workflow
        .run(serde_json::json!({ "queries": queries }))?
        .await?;
    println!("\n📊 Combined {} answers", result.result::<usize>()?.unwrap_or_default());
    Ok(())
}
