//! Graphviz rendering of workflows and executions.

use std::{collections::BTreeSet, fmt::Write};

use crate::{event::kinds, observe::StepSpan, workflow::Workflow};

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn event_node(kind: &str) -> String {
    quote(&format!("event:{kind}"))
}

fn event_style(workflow: Option<&Workflow>, kind: &str) -> &'static str {
    let is_stop = match workflow {
        Some(workflow) => workflow.stop_kinds().any(|k| k == kind),
        None => kind == kinds::STOP,
    };
    if is_stop {
        "fillcolor=lightcoral"
    } else if workflow.is_some_and(|w| w.start_kind() == kind) {
        "fillcolor=lightgreen"
    } else if kind == kinds::INPUT_REQUIRED || kind == kinds::HUMAN_RESPONSE {
        "fillcolor=lightyellow"
    } else {
        "fillcolor=lightskyblue"
    }
}

/// Every step with the events it accepts and emits.
pub fn draw_all_possible_flows(workflow: &Workflow) -> String {
    let mut events = BTreeSet::new();
    for step in workflow.steps() {
        events.extend(step.accepted_kinds().iter().map(String::as_str));
        events.extend(step.emitted_kinds().iter().map(String::as_str));
    }

    let mut dot = String::new();
    let _ = writeln!(dot, "digraph {} {{", quote(workflow.name()));
    let _ = writeln!(dot, "  rankdir=LR;");
    for kind in &events {
        let _ = writeln!(
            dot,
            "  {} [label={}, shape=ellipse, style=filled, {}];",
            event_node(kind),
            quote(kind),
            event_style(Some(workflow), kind)
        );
    }
    for step in workflow.steps() {
        let node = quote(&format!("step:{}", step.name()));
        let _ = writeln!(dot, "  {node} [label={}, shape=box];", quote(step.name()));
        for kind in step.accepted_kinds() {
            let _ = writeln!(dot, "  {} -> {node};", event_node(kind));
        }
        for kind in step.emitted_kinds() {
            let _ = writeln!(dot, "  {node} -> {};", event_node(kind));
        }
    }
    dot.push_str("}\n");
    dot
}

/// The invocations recorded in `spans`, numbered in start order.
pub fn draw_execution(spans: &[StepSpan]) -> String {
    let mut ordered: Vec<&StepSpan> = spans.iter().collect();
    ordered.sort_by_key(|span| span.started_at);

    let mut events = BTreeSet::new();
    for span in &ordered {
        events.insert(span.input.kind());
        if let Some(output) = &span.output {
            events.insert(output.kind());
        }
    }

    let mut dot = String::new();
    let _ = writeln!(dot, "digraph \"execution\" {{");
    let _ = writeln!(dot, "  rankdir=LR;");
    for kind in &events {
        let _ = writeln!(
            dot,
            "  {} [label={}, shape=ellipse, style=filled, {}];",
            event_node(kind),
            quote(kind),
            event_style(None, kind)
        );
    }
    for (index, span) in ordered.iter().enumerate() {
        let node = quote(&format!("run:{index}"));
        let label = format!("{}. {} (attempt {})", index + 1, span.step, span.attempt);
        let color = if span.succeeded() { "palegreen" } else { "salmon" };
        let _ = writeln!(
            dot,
            "  {node} [label={}, shape=box, style=filled, fillcolor={color}];",
            quote(&label)
        );
        let _ = writeln!(dot, "  {} -> {node};", event_node(span.input.kind()));
        if let Some(output) = &span.output {
            let _ = writeln!(dot, "  {node} -> {};", event_node(output.kind()));
        }
    }
    dot.push_str("}\n");
    dot
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        event::Event,
        step::{StepSpec, helpers},
    };

    #[test]
    fn draws_declared_graph() {
        let workflow = Workflow::builder()
            .name("jokes")
            .step(StepSpec::new("write", helpers::relabel("joke")).accepts("start").emits("joke"))
            .step(StepSpec::new("critique", helpers::finish()).accepts("joke").emits("stop"))
            .build()
            .unwrap();

        let dot = workflow.draw_all_possible_flows();
        assert!(dot.starts_with("digraph \"jokes\" {"));
        assert!(dot.contains("\"event:start\" -> \"step:write\";"));
        assert!(dot.contains("\"step:write\" -> \"event:joke\";"));
        assert!(dot.contains("\"step:critique\" -> \"event:stop\";"));
        assert!(dot.contains("fillcolor=lightcoral"));
    }

    #[test]
    fn draws_execution_in_start_order() {
        let t0 = Utc::now();
        let span = |step: &str, offset: i64, input: &str, output: Option<&str>| StepSpan {
            run_id: Uuid::nil(),
            step: step.to_string(),
            attempt: 1,
            started_at: t0 + chrono::Duration::milliseconds(offset),
            finished_at: t0 + chrono::Duration::milliseconds(offset + 1),
            input: Event::new(input),
            output: output.map(Event::new),
            error: None,
        };
        let spans = vec![
            span("critique", 10, "joke", Some("stop")),
            span("write", 0, "start", Some("joke")),
        ];

        let dot = draw_execution(&spans);
        assert!(dot.contains("\"1. write (attempt 1)\""));
        assert!(dot.contains("\"2. critique (attempt 1)\""));
        assert!(dot.contains("\"run:1\" -> \"event:stop\";"));
    }
}
