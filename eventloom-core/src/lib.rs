//! # EventLoom
//!
//! An in-process, event-driven workflow engine built on tokio.
//!
//! ## Core Concepts
//!
//! - **Event**: a kind plus a JSON payload; `start` enters a run, `stop` ends it
//! - **Step**: an async handler triggered by one or more event kinds
//! - **Context**: per-run state store, join buffers and pending work, snapshot-able
//! - **Workflow**: validated set of steps, resources and configuration
//! - **RunHandle**: result, event stream, external events and cancellation of one run
//!
//! ## Quick Start
//!
//! ```rust
//! use eventloom_core::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let workflow = Workflow::builder()
//!     .name("greeter")
//!     .step(
//!         StepSpec::new(
//!             "greet",
//!             step_fn(|_ctx, event| async move {
//!                 let name: String = event.get("name")?.unwrap_or_default();
//!                 Ok(Some(Event::stop(format!("Hello, {name}!"))?))
//!             }),
//!         )
//!         .accepts("start")
//!         .emits("stop"),
//!     )
//!     .build()?;
//!
//! let result = workflow.run(serde_json::json!({"name": "Ada"}))?.await?;
//! assert_eq!(result.result::<String>()?, Some("Hello, Ada!".to_string()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod draw;
pub mod error;
pub mod event;
pub mod handle;
pub mod observe;
pub mod registry;
pub mod resource;
pub mod retry;
mod scheduler;
pub mod state;
pub mod step;
pub mod workflow;


/// Convenient re-exports for common use.
pub mod prelude {
    pub use async_trait::async_trait;
    pub use eyre;
    pub use serde::{Deserialize, Serialize};
    pub use tokio;

    pub use crate::{
        config::{InFlightPolicy, WorkflowConfig},
        context::{Context, ContextBuilder, ContextSnapshot},
        draw::draw_execution,
        error::{FlowError, Result},
        event::{
            Event, EventPayload, HumanResponse, InputRequired, WorkflowCancelled, WorkflowFailed,
            WorkflowTimedOut, kinds,
        },
        handle::{EventStream, RunHandle, RunStatus},
        observe::{InMemorySink, SpanSink, StepSpan, TracingSink},
        registry::{HandlerInfo, WorkflowRegistry},
        resource::{ResourceDef, ResourceResolver},
        retry::{ConstantDelayRetryPolicy, ExponentialBackoffRetryPolicy, NoRetry, RetryPolicy},
        state::{StateGuard, StateModel, StateStore},
        step::{FnStep, Step, StepContext, StepSpec, helpers, step_fn},
        workflow::{Workflow, WorkflowBuilder},
    };
}
