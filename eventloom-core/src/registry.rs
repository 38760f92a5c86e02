//! Named workflows and the runs started through them.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{FlowError, Result},
    handle::{RunHandle, RunStatus},
    workflow::Workflow,
};

/// Bookkeeping for one run started through a [`WorkflowRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub handler_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Registry of named workflows.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: Arc<RwLock<BTreeMap<String, Workflow>>>,
    handlers: Arc<RwLock<BTreeMap<Uuid, HandlerInfo>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under `name`.
    pub async fn add_workflow(&self, name: impl Into<String>, workflow: Workflow) -> Result<()> {
        let name = name.into();
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&name) {
            return Err(FlowError::construction(format!(
                "workflow '{name}' already registered"
            )));
        }
        workflows.insert(name, workflow);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Workflow> {
        self.workflows.read().await.get(name).cloned()
    }

    /// Registered names, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.workflows.read().await.keys().cloned().collect()
    }

    /// Start a run of the named workflow and track it.
    pub async fn run(&self, name: &str, kwargs: Value) -> Result<RunHandle> {
        let workflow = self
            .get(name)
            .await
            .ok_or_else(|| FlowError::construction(format!("Workflow '{name}' not found")))?;
        let handle = workflow.run(kwargs)?;
        let handler_id = handle.run_id();

        self.handlers.write().await.insert(
            handler_id,
            HandlerInfo {
                handler_id,
                workflow: name.to_string(),
                status: RunStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
            },
        );

        let handlers = Arc::clone(&self.handlers);
        let mut status = handle.status_receiver();
        tokio::spawn(async move {
            let _ = status.wait_for(RunStatus::is_terminal).await;
            let final_status = *status.borrow();
            if let Some(info) = handlers.write().await.get_mut(&handler_id) {
                info.status = final_status;
                info.completed_at = Some(Utc::now());
            }
        });

        Ok(handle)
    }

    /// Every run started so far, in id order.
    pub async fn handlers(&self) -> Vec<HandlerInfo> {
        self.handlers.read().await.values().cloned().collect()
    }

    pub async fn handler(&self, handler_id: Uuid) -> Option<HandlerInfo> {
        self.handlers.read().await.get(&handler_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        event::Event,
        step::{StepSpec, helpers, step_fn},
    };

    fn echo() -> Workflow {
        Workflow::builder()
            .name("echo")
            .step(StepSpec::new("echo", helpers::finish()).accepts("start").emits("stop"))
            .build()
            .unwrap()
    }

    fn waiter() -> Workflow {
        Workflow::builder()
            .name("waiter")
            .step(
                StepSpec::new(
                    "wait",
                    step_fn(|_ctx, _ev| async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(Some(Event::stop("late")?))
                    }),
                )
                .accepts("start")
                .emits("stop"),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn register_and_list() {
        let registry = WorkflowRegistry::new();
        registry.add_workflow("echo", echo()).await.unwrap();
        registry.add_workflow("waiter", waiter()).await.unwrap();

        assert_eq!(registry.list().await, vec!["echo", "waiter"]);
        assert!(registry.get("echo").await.is_some());
        assert!(registry.add_workflow("echo", echo()).await.is_err());
        assert!(registry.run("missing", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn tracks_handler_status() {
        let registry = WorkflowRegistry::new();
        registry.add_workflow("echo", echo()).await.unwrap();
        registry.add_workflow("waiter", waiter()).await.unwrap();

        let done = registry.run("echo", json!({"msg": "hi"})).await.unwrap();
        let done_id = done.run_id();
        let result = done.await.unwrap();
        assert_eq!(result.result::<Value>().unwrap(), Some(json!({"msg": "hi"})));

        let slow = registry.run("waiter", json!({})).await.unwrap();
        let slow_id = slow.run_id();
        slow.cancel();
        assert_eq!(slow.wait_terminal().await, RunStatus::Cancelled);

        // The watcher task updates the record shortly after the run ends.
        for _ in 0..50 {
            let finished = registry
                .handlers()
                .await
                .iter()
                .all(|h| h.completed_at.is_some());
            if finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            registry.handler(done_id).await.unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(
            registry.handler(slow_id).await.unwrap().status,
            RunStatus::Cancelled
        );
        assert_eq!(registry.handlers().await.len(), 2);
    }
}
