use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::task_runner::run_task;
use crate::action::ExecutionContext;
use crate::error::{EngineError, error_cause};
use crate::model::{DataItem, ExecutionRecord, Job, JobExecution};
use crate::trigger::EventSource;

/// Payload of one inbound event.
pub type EventPayload = Map<String, Value>;

/// Drives one run of a job through its tasks, in order, and leaves the
/// execution record in a terminal state.
#[derive(Debug, Clone, Default)]
pub struct JobRunner {
    simulation: bool,
    event_budget: Option<u64>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner whose actions see `ctx.simulation == true`.
    pub fn simulation() -> Self {
        Self {
            simulation: true,
            event_budget: None,
        }
    }

    /// Stops an event-driven run after `budget` events.
    pub fn with_event_budget(mut self, budget: Option<u64>) -> Self {
        self.event_budget = budget;
        self
    }

    /// Runs `job` against `execution`.
    ///
    /// Event-driven jobs consume `events` until the channel closes, the run is
    /// cancelled or the event budget is used up. Every other job runs its task
    /// sequence once on the trigger's payload.
    pub async fn run(
        &self,
        job: Arc<Job>,
        execution: Arc<JobExecution>,
        events: Option<mpsc::Receiver<EventPayload>>,
    ) -> ExecutionRecord {
        if execution.is_cancelled() {
            debug!(job = %job.id, "execution cancelled before it started");
            return execution.snapshot();
        }
        execution.mark_started();
        info!(job = %job.id, execution = %execution.id(), simulation = self.simulation, "Starting job '{}'", job.name);

        let result = if job.trigger.is_event_driven() {
            match events {
                Some(events) => self.listen(&job, &execution, events).await,
                None => Err(EngineError::Config(format!(
                    "event-driven job '{}' started without an event channel",
                    job.id
                ))),
            }
        } else {
            self.run_tasks(&job, &execution, job.trigger.data()).await
        };

        match result {
            Ok(()) => {
                execution.finish();
            }
            Err(err) => {
                let cause = error_cause(&err);
                error!(job = %job.id, "Job failed: {cause}");
                execution.fail(cause);
            }
        }

        let record = execution.snapshot();
        info!(job = %job.id, state = %record.state, "Job '{}' ended", job.name);
        record
    }

    async fn listen(
        &self,
        job: &Arc<Job>,
        execution: &Arc<JobExecution>,
        mut events: mpsc::Receiver<EventPayload>,
    ) -> Result<(), EngineError> {
        let mut processed = 0u64;
        loop {
            if self.event_budget.is_some_and(|budget| processed >= budget) {
                return Ok(());
            }
            let payload = tokio::select! {
                _ = execution.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(payload) => payload,
                    None => return Ok(()),
                },
            };

            debug!(job = %job.id, "processing inbound event");
            execution.increment_processed_events();
            let mut data = job.trigger.data();
            data.extend(payload);
            self.run_tasks(job, execution, data).await?;
            processed += 1;
        }
    }

    async fn run_tasks(
        &self,
        job: &Arc<Job>,
        execution: &Arc<JobExecution>,
        data: Map<String, Value>,
    ) -> Result<(), EngineError> {
        let mut trigger_meta = job.trigger.meta();
        if self.simulation {
            trigger_meta.insert("simulation".into(), Value::Bool(true));
        }

        for (index, task) in job.tasks.iter().enumerate() {
            if execution.is_cancelled() {
                break;
            }
            execution.set_current_task(&task.name);
            debug!(job = %job.id, task = %task.name, "running task");

            let ctx = ExecutionContext {
                job_id: job.id.clone(),
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                execution: Arc::clone(execution),
                simulation: self.simulation,
            };
            let input = DataItem::initial(&job.id, &task.id, trigger_meta.clone(), data.clone());
            let report = run_task(job, index, vec![input], &ctx)
                .await
                .map_err(|source| EngineError::TaskFailed {
                    task: task.name.clone(),
                    source,
                })?;

            debug!(task = %task.name, processed = report.processed, outputs = report.outputs.len(), "task done");
            if report.cancelled {
                break;
            }
        }
        Ok(())
    }
}

/// Pumps messages from a trigger's event source into the run's event
/// channel until the run ends or the source closes.
pub(crate) fn forward_events(
    job_id: String,
    mut source: EventSource,
    events: mpsc::Sender<EventPayload>,
    execution: Arc<JobExecution>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = execution.cancelled() => break,
                _ = events.closed() => break,
                received = source.recv() => received,
            };
            match received {
                Ok(message) => {
                    debug!(job = %job_id, "routing inbound message");
                    if events.send(message.into_payload()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job = %job_id, skipped, "event source lagged, messages dropped")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(job = %job_id, "event forwarding stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::action::util::PauseAction;
    use crate::action::{Action, ActionMeta};
    use crate::error::ActionError;
    use crate::model::{ExecutionState, Task};
    use crate::trigger::{EventTrigger, ManualTrigger};

    struct Counter {
        meta: ActionMeta,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Counter {
        fn new(calls: &Arc<AtomicUsize>) -> Self {
            Self {
                meta: ActionMeta::new("count"),
                calls: Arc::clone(calls),
                fail: false,
            }
        }

        fn failing(calls: &Arc<AtomicUsize>) -> Self {
            Self {
                fail: true,
                ..Self::new(calls)
            }
        }
    }

    #[async_trait]
    impl Action for Counter {
        fn meta(&self) -> &ActionMeta {
            &self.meta
        }

        async fn process(&self, item: DataItem, _: &ExecutionContext) -> Result<Vec<DataItem>, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ActionError::Rejected {
                    connector: "remote".into(),
                    message: "quota exceeded".into(),
                });
            }
            Ok(vec![item])
        }
    }

    fn manual_job() -> Job {
        Job::new("job-1", "Import", Box::new(ManualTrigger::new()))
    }

    #[tokio::test]
    async fn runs_all_tasks_and_finishes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let job = manual_job()
            .with_task(Task::new("t1", "first").with_action(Counter::new(&calls)))
            .with_task(Task::new("t2", "second").with_action(Counter::new(&calls)));
        let execution = Arc::new(JobExecution::new("job-1", "Import"));

        let record = JobRunner::new().run(Arc::new(job), execution, None).await;
        assert_eq!(record.state, ExecutionState::Finished);
        assert_eq!(record.current_task.as_deref(), Some("second"));
        assert!(record.started.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_task_stops_the_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let later = Arc::new(AtomicUsize::new(0));
        let job = manual_job()
            .with_task(Task::new("t1", "first").with_action(Counter::new(&calls)))
            .with_task(Task::new("t2", "second").with_action(Counter::failing(&calls)))
            .with_task(Task::new("t3", "third").with_action(Counter::new(&later)));
        let execution = Arc::new(JobExecution::new("job-1", "Import"));

        let record = JobRunner::new().run(Arc::new(job), execution, None).await;
        assert_eq!(record.state, ExecutionState::Failed);
        assert_eq!(record.current_task.as_deref(), Some("second"));
        let cause = record.error_cause.unwrap();
        assert!(cause.contains("quota exceeded"), "{cause}");
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_during_second_task() {
        let later = Arc::new(AtomicUsize::new(0));
        let job = manual_job()
            .with_task(Task::new("t1", "first"))
            .with_task(
                Task::new("t2", "second")
                    .with_action(PauseAction::new(ActionMeta::new("wait"), Duration::from_secs(30))),
            )
            .with_task(Task::new("t3", "third").with_action(Counter::new(&later)));
        let execution = Arc::new(JobExecution::new("job-1", "Import"));

        let run = {
            let execution = Arc::clone(&execution);
            tokio::spawn(async move { JobRunner::new().run(Arc::new(job), execution, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(execution.cancel());

        let record = run.await.unwrap();
        assert_eq!(record.state, ExecutionState::Cancelled);
        assert_eq!(record.current_task.as_deref(), Some("second"));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let job = manual_job().with_task(Task::new("t1", "first").with_action(Counter::new(&calls)));
        let execution = Arc::new(JobExecution::new("job-1", "Import"));
        execution.cancel();

        let record = JobRunner::new().run(Arc::new(job), execution, None).await;
        assert_eq!(record.state, ExecutionState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn event_job_processes_until_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let job = Job::new("job-1", "Hook", Box::new(EventTrigger::new("webhook")))
            .with_task(Task::new("t1", "handle").with_action(Counter::new(&calls)));
        let execution = Arc::new(JobExecution::new("job-1", "Hook"));
        let (tx, rx) = mpsc::channel(4);
        for n in 0..3 {
            let mut payload = Map::new();
            payload.insert("n".into(), json!(n));
            tx.send(payload).await.unwrap();
        }

        let record = JobRunner::new()
            .with_event_budget(Some(2))
            .run(Arc::new(job), execution, Some(rx))
            .await;
        assert_eq!(record.state, ExecutionState::Finished);
        assert_eq!(record.processed_events, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn event_job_without_channel_fails() {
        let job = Job::new("job-1", "Hook", Box::new(EventTrigger::new("webhook")));
        let execution = Arc::new(JobExecution::new("job-1", "Hook"));
        let record = JobRunner::new().run(Arc::new(job), execution, None).await;
        assert_eq!(record.state, ExecutionState::Failed);
    }
}
