//! # EventLoom Agent
//!
//! Steps that talk to a language model or run tools, built on two narrow
//! collaborator interfaces:
//!
//! - [`CompletionProvider`](provider::CompletionProvider): prompt in, text (or
//!   a stream of text deltas) out
//! - [`ToolExecutor`](tools::ToolExecutor): structured call in, structured
//!   result out, optionally gated by human confirmation
//!
//! No vendor SDK is bundled; implement the traits for the model or tool
//! backend you use. [`ScriptedProvider`](provider::ScriptedProvider) replays
//! canned replies for tests and demos.

pub mod completion;
pub mod error;
pub mod provider;
pub mod retry;
pub mod tools;

pub use error::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        completion::{Progress, completion_step},
        error::{AgentError, Result},
        provider::{
            Completion, CompletionProvider, CompletionRequest, DeltaStream, ScriptedProvider,
            StreamChunk, TokenUsage,
        },
        retry::AgentRetryPolicy,
        tools::{FnToolExecutor, ToolCall, ToolExecutor, ToolOutput, ToolRegistry, tool_step},
    };
}
