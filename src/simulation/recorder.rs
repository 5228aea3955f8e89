use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::action::{Action, ActionMeta, ExecutionContext};
use crate::error::{ActionError, error_cause};
use crate::model::{DataItem, SIMULATION_LOG_KEY};
use crate::simulation::Sandbox;

/// Items an action produced during a simulation and the error it raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSimulation {
    pub action_id: String,
    pub action_name: String,
    pub items: Vec<DataItem>,
    pub error_cause: Option<String>,
}

/// Wraps an action for a simulation run.
///
/// Every invocation past `limit` returns no items without calling the
/// wrapped action, and each invocation passes at most `limit` items
/// downstream. Results are kept in a shared slot the orchestrator reads
/// once the run is over.
pub(crate) struct RecordingAction {
    inner: Box<dyn Action>,
    limit: usize,
    invocations: AtomicUsize,
    result: Arc<Mutex<ActionSimulation>>,
}

impl RecordingAction {
    pub(crate) fn new(inner: Box<dyn Action>, limit: usize) -> Self {
        let result = ActionSimulation {
            action_id: inner.meta().id.clone(),
            action_name: inner.meta().name.clone(),
            ..ActionSimulation::default()
        };
        Self {
            inner,
            limit: limit.max(1),
            invocations: AtomicUsize::new(0),
            result: Arc::new(Mutex::new(result)),
        }
    }

    pub(crate) fn result(&self) -> Arc<Mutex<ActionSimulation>> {
        Arc::clone(&self.result)
    }

    fn record_error(&self, err: &ActionError) {
        if matches!(err, ActionError::Cancelled) {
            return;
        }
        let mut result = self.result.lock();
        if result.error_cause.is_none() {
            result.error_cause = Some(error_cause(err));
        }
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn meta(&self) -> &ActionMeta {
        self.inner.meta()
    }

    fn max_parallelism(&self) -> Option<usize> {
        self.inner.max_parallelism()
    }

    async fn setup(&self, ctx: &ExecutionContext) -> Result<(), ActionError> {
        self.invocations.store(0, Ordering::SeqCst);
        self.inner
            .setup(ctx)
            .await
            .inspect_err(|err| self.record_error(err))
    }

    async fn process(
        &self,
        mut item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if invocation > self.limit {
            return Ok(Vec::new());
        }

        // The note explains this action's output only.
        item.remove(SIMULATION_LOG_KEY);
        let mut items = self
            .inner
            .process(item, ctx)
            .await
            .inspect_err(|err| self.record_error(err))?;
        items.truncate(self.limit);

        let mut result = self.result.lock();
        let room = self.limit.saturating_sub(result.items.len());
        result.items.extend(items.iter().take(room).cloned());
        Ok(items)
    }

    async fn teardown(&self, ctx: &ExecutionContext) -> Result<(), ActionError> {
        self.inner
            .teardown(ctx)
            .await
            .inspect_err(|err| self.record_error(err))
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.inner.sandbox(sandbox);
    }
}
