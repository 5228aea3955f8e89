//! The action capability and the built-in actions.
//!
//! An [`Action`] is one pipeline stage: it receives a single data item and
//! returns zero (filter), one (transform) or many (fan-out) items. Shared
//! defaults such as ids, type identifiers and the parallelism override live
//! in the plain [`ActionMeta`] struct handed to each constructor.

pub mod file;
pub mod message;
pub mod template;
pub mod util;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ActionError;
use crate::model::{DataItem, JobExecution, WorkInProgressMonitor};
use crate::simulation::Sandbox;

/// Configuration shared by every action type.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMeta {
    pub id: String,
    pub name: String,
    pub type_id: String,
    pub category_id: String,
    /// Inactive actions are skipped by the task runner.
    pub active: bool,
    /// Upper bound on items this action may process concurrently.
    pub max_parallelism: Option<usize>,
}

impl ActionMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            type_id: String::new(),
            category_id: String::new(),
            active: true,
            max_parallelism: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_type(mut self, category_id: &str, type_id: &str) -> Self {
        self.category_id = category_id.to_string();
        self.type_id = type_id.to_string();
        self
    }
}

/// Everything an action invocation may know about the run it belongs to.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub task_id: String,
    pub task_name: String,
    pub execution: Arc<JobExecution>,
    /// Set when the job runs as a dry-run simulation.
    pub simulation: bool,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.execution.is_cancelled()
    }

    /// Progress monitor for a long sub-operation, cancelled with the run.
    pub fn work_in_progress(&self, name: impl Into<String>) -> WorkInProgressMonitor {
        self.execution.work_in_progress(name)
    }
}

/// One pipeline stage.
#[async_trait]
pub trait Action: Send + Sync {
    fn meta(&self) -> &ActionMeta;

    /// Stricter-than-task parallelism, e.g. `Some(1)` for actions holding an
    /// exclusive resource or counting items.
    fn max_parallelism(&self) -> Option<usize> {
        self.meta().max_parallelism
    }

    /// Called once before the first item; resets per-run state.
    async fn setup(&self, _ctx: &ExecutionContext) -> Result<(), ActionError> {
        Ok(())
    }

    async fn process(
        &self,
        item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError>;

    /// Called after the last item, also when the task failed.
    async fn teardown(&self, _ctx: &ExecutionContext) -> Result<(), ActionError> {
        Ok(())
    }

    /// Replaces every capability this action holds with its simulation
    /// wrapper. Actions without connectors keep the default.
    fn sandbox(&mut self, _sandbox: &Sandbox) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::ExecutionContext;
    use crate::model::JobExecution;

    pub fn context() -> ExecutionContext {
        ExecutionContext {
            job_id: "job-1".into(),
            task_id: "task-1".into(),
            task_name: "task".into(),
            execution: Arc::new(JobExecution::new("job-1", "job")),
            simulation: false,
        }
    }

    pub fn simulation_context() -> ExecutionContext {
        ExecutionContext {
            simulation: true,
            ..context()
        }
    }
}
