//! Pushes data items through the action pipeline of one task.
//!
//! Work is scheduled as `(stage, item)` units. A unit runs one action on one
//! item; each output item becomes a unit of the next stage. Units are
//! dispatched from a queue into a [`JoinSet`] bounded by the task's effective
//! parallelism. Outputs are queued in front so one item travels the whole
//! pipeline before its siblings pile up.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::action::ExecutionContext;
use crate::error::ActionError;
use crate::model::{DataItem, Job};

/// What a task run produced.
#[derive(Debug, Default)]
pub struct TaskReport {
    /// Items that left the last active action.
    pub outputs: Vec<DataItem>,
    /// Units that completed, across all stages.
    pub processed: usize,
    /// Dispatch stopped because the execution was cancelled.
    pub cancelled: bool,
}

/// Runs task `task_index` of `job` on `inputs`.
///
/// Every active action is set up in order before the first item and torn
/// down in reverse order afterwards, also when the task fails. The first
/// action error stops dispatch; units already in flight are drained and the
/// error is returned.
pub async fn run_task(
    job: &Arc<Job>,
    task_index: usize,
    inputs: Vec<DataItem>,
    ctx: &ExecutionContext,
) -> Result<TaskReport, ActionError> {
    let task = &job.tasks[task_index];
    let stages: Arc<[usize]> = task
        .actions
        .iter()
        .enumerate()
        .filter(|(_, action)| action.meta().active)
        .map(|(index, _)| index)
        .collect();

    if stages.is_empty() {
        return Ok(TaskReport {
            outputs: inputs,
            ..TaskReport::default()
        });
    }

    for (position, &index) in stages.iter().enumerate() {
        if let Err(err) = task.actions[index].setup(ctx).await {
            teardown(job, task_index, &stages[..position], ctx).await;
            return Err(err);
        }
    }

    let result = drive(job, task_index, &stages, inputs, ctx).await;
    let teardown_error = teardown(job, task_index, &stages, ctx).await;

    match (result, teardown_error) {
        (Ok(report), Some(err)) if !report.cancelled => Err(err),
        (result, _) => result,
    }
}

async fn drive(
    job: &Arc<Job>,
    task_index: usize,
    stages: &Arc<[usize]>,
    inputs: Vec<DataItem>,
    ctx: &ExecutionContext,
) -> Result<TaskReport, ActionError> {
    let limit = job.tasks[task_index]
        .effective_parallelism()
        .unwrap_or(usize::MAX);
    let mut pending: VecDeque<(usize, DataItem)> = inputs.into_iter().map(|item| (0, item)).collect();
    let mut workers: JoinSet<(usize, Result<Vec<DataItem>, ActionError>)> = JoinSet::new();
    let mut report = TaskReport::default();
    let mut failure: Option<ActionError> = None;

    loop {
        if failure.is_none() && !report.cancelled {
            while workers.len() < limit {
                if ctx.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let Some((stage, item)) = pending.pop_front() else {
                    break;
                };
                let job = Arc::clone(job);
                let stages = Arc::clone(stages);
                let ctx = ctx.clone();
                workers.spawn(async move {
                    let action = &job.tasks[task_index].actions[stages[stage]];
                    let result = action.process(item, &ctx).await;
                    (stage, result)
                });
            }
        }

        let Some(joined) = workers.join_next().await else {
            break;
        };

        match joined {
            Ok((stage, Ok(items))) => {
                report.processed += 1;
                let next = stage + 1;
                if next == stages.len() {
                    report.outputs.extend(items);
                } else {
                    for item in items.into_iter().rev() {
                        pending.push_front((next, item));
                    }
                }
            }
            Ok((_, Err(ActionError::Cancelled))) if ctx.is_cancelled() => {
                report.cancelled = true;
            }
            Ok((stage, Err(err))) => {
                debug!(
                    task = %ctx.task_name,
                    action = %job.tasks[task_index].actions[stages[stage]].meta().name,
                    "action failed: {err}"
                );
                failure.get_or_insert(err);
            }
            Err(join_error) => {
                failure.get_or_insert(ActionError::Panicked(join_error.to_string()));
            }
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }
    if !pending.is_empty() {
        report.cancelled = true;
    }
    Ok(report)
}

/// Tears down the given stages in reverse order. Errors are logged; the first
/// one is returned so a successful run can still report it.
async fn teardown(
    job: &Arc<Job>,
    task_index: usize,
    stages: &[usize],
    ctx: &ExecutionContext,
) -> Option<ActionError> {
    let mut first = None;
    for &index in stages.iter().rev() {
        let action = &job.tasks[task_index].actions[index];
        if let Err(err) = action.teardown(ctx).await {
            warn!(action = %action.meta().name, "teardown failed: {err}");
            first.get_or_insert(err);
        }
    }
    first
}
