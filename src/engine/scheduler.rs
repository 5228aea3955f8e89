use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::JobExecutor;
use crate::error::EngineError;
use crate::model::Job;
use crate::trigger::{TriggerKind, parse_schedule};

/// Materializes a fresh job graph for each run.
pub type JobFactory = Arc<dyn Fn() -> Result<Job, EngineError> + Send + Sync>;

/// Starts jobs according to their triggers until stopped.
pub struct Scheduler {
    executor: Arc<JobExecutor>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self {
            executor,
            cancel: CancellationToken::new(),
        }
    }

    /// Schedules the job produced by `factory`.
    ///
    /// Interval and cron jobs get a loop that submits a run at every fire
    /// time; a tick that finds the previous run still active is skipped. Event jobs are started
    /// once and stay active. Manual jobs are not scheduled.
    pub fn schedule(&self, factory: JobFactory) -> Result<Option<JoinHandle<()>>, EngineError> {
        let job = factory()?;
        match job.trigger.kind() {
            TriggerKind::Interval(every) => {
                info!(job = %job.id, "scheduling every {}s", every.as_secs());
                Ok(Some(self.spawn_interval(job.id, every, factory)))
            }
            TriggerKind::Cron { expression } => {
                let schedule = parse_schedule(&expression)?;
                info!(job = %job.id, "scheduling on cron '{expression}'");
                Ok(Some(self.spawn_cron(job.id, schedule, factory)))
            }
            TriggerKind::Event { event_type } => {
                info!(job = %job.id, event_type = %event_type, "activating event job");
                self.executor.run_job(job)?;
                Ok(None)
            }
            TriggerKind::Manual => {
                debug!(job = %job.id, "manual job is not scheduled");
                Ok(None)
            }
        }
    }

    fn spawn_interval(&self, job_id: String, every: Duration, factory: JobFactory) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                submit(&executor, &job_id, &factory);
            }
            debug!(job = %job_id, "interval loop stopped");
        })
    }

    fn spawn_cron(&self, job_id: String, schedule: Schedule, factory: JobFactory) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            while let Some(next) = schedule.after(&Utc::now()).next() {
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                debug!(job = %job_id, "next cron run at {next}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                submit(&executor, &job_id, &factory);
            }
            debug!(job = %job_id, "cron loop stopped");
        })
    }

    /// Routes newline-delimited JSON events from `reader` to the active event
    /// jobs until end of input or [`stop`](Self::stop).
    ///
    /// An object with a string `job` key goes to that job only (the key is
    /// removed), any other object to every job in `event_jobs`. Returns the
    /// number of deliveries.
    pub async fn route_events<R>(&self, reader: R, event_jobs: &[String]) -> Result<usize, EngineError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut delivered = 0;
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let mut payload = match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(payload)) => payload,
                Ok(_) => {
                    warn!("ignoring event that is not a JSON object");
                    continue;
                }
                Err(err) => {
                    warn!("ignoring malformed event: {err}");
                    continue;
                }
            };
            let targets = match payload.remove("job") {
                Some(Value::String(job_id)) => vec![job_id],
                Some(other) => {
                    payload.insert("job".into(), other);
                    event_jobs.to_vec()
                }
                None => event_jobs.to_vec(),
            };
            for job_id in targets {
                if self.executor.on_inbound_event(&job_id, payload.clone()).await {
                    delivered += 1;
                } else {
                    warn!(job = %job_id, "no active event run, dropping event");
                }
            }
        }
        Ok(delivered)
    }

    /// Stops every interval loop and cancels active event-driven runs.
    pub fn stop(&self, event_jobs: &[String]) {
        self.cancel.cancel();
        for job_id in event_jobs {
            self.executor.cancel_job(job_id);
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn submit(executor: &JobExecutor, job_id: &str, factory: &JobFactory) {
    match factory().and_then(|job| executor.run_job(job)) {
        Ok(handle) => debug!(job = %job_id, execution = %handle.execution().id(), "scheduled run submitted"),
        Err(EngineError::JobAlreadyRunning(_)) => {
            debug!(job = %job_id, "previous run still active, skipping tick")
        }
        Err(err) => warn!(job = %job_id, "failed to start scheduled run: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::model::ExecutionState;
    use crate::store::{ExecutionStore, InMemoryExecutionStore};
    use crate::trigger::{CronTrigger, EventTrigger, IntervalTrigger, ManualTrigger};

    #[tokio::test]
    async fn interval_job_runs_repeatedly_until_stopped() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let executor = Arc::new(JobExecutor::new(2, store.clone()));
        let scheduler = Scheduler::new(Arc::clone(&executor));
        let built = Arc::new(AtomicUsize::new(0));

        let factory: JobFactory = {
            let built = Arc::clone(&built);
            Arc::new(move || {
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Job::new("tick", "tick", Box::new(IntervalTrigger::new(Duration::from_millis(20)))))
            })
        };
        let handle = scheduler.schedule(factory).unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.stop(&[]);
        handle.await.unwrap();

        let runs = store.load_history("tick", Some(ExecutionState::Finished), 0, 100).unwrap();
        assert!(runs.total >= 2, "only {} runs", runs.total);
        assert!(built.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn cron_job_runs_every_second() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let executor = Arc::new(JobExecutor::new(2, store.clone()));
        let scheduler = Scheduler::new(Arc::clone(&executor));
        let factory: JobFactory = Arc::new(|| {
            Ok(Job::new("cron", "cron", Box::new(CronTrigger::new("* * * * * *")?)))
        });

        let handle = scheduler.schedule(factory).unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(2300)).await;
        scheduler.stop(&[]);
        handle.await.unwrap();

        let runs = store.load_history("cron", None, 0, 100).unwrap();
        assert!(runs.total >= 2, "only {} runs", runs.total);
    }

    #[tokio::test]
    async fn event_job_is_activated_once() {
        let executor = Arc::new(JobExecutor::new(2, Arc::new(InMemoryExecutionStore::new())));
        let scheduler = Scheduler::new(Arc::clone(&executor));
        let factory: JobFactory =
            Arc::new(|| Ok(Job::new("hook", "hook", Box::new(EventTrigger::new("webhook")))));

        assert!(scheduler.schedule(factory).unwrap().is_none());
        assert!(executor.is_running("hook"));

        scheduler.stop(&["hook".to_string()]);
    }

    #[tokio::test]
    async fn events_from_lines_reach_their_jobs() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let executor = Arc::new(JobExecutor::new(2, store.clone()));
        let scheduler = Scheduler::new(Arc::clone(&executor));
        for id in ["a", "b"] {
            let factory: JobFactory =
                Arc::new(move || Ok(Job::new(id, id, Box::new(EventTrigger::new("line")))));
            scheduler.schedule(factory).unwrap();
        }
        let event_jobs = vec!["a".to_string(), "b".to_string()];

        let input = "{\"n\": 1}\nnot json\n\n{\"job\": \"b\", \"n\": 2}\n{\"job\": \"gone\"}\n";
        let delivered = scheduler.route_events(input.as_bytes(), &event_jobs).await.unwrap();
        assert_eq!(delivered, 3);

        // let the runs drain their queues before stopping them
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop(&event_jobs);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let processed = |id: &str| {
            store.load_history(id, None, 0, 1).unwrap().items[0].processed_events
        };
        assert_eq!(processed("a"), 1);
        assert_eq!(processed("b"), 2);
    }

    #[tokio::test]
    async fn manual_job_is_left_alone() {
        let executor = Arc::new(JobExecutor::new(1, Arc::new(InMemoryExecutionStore::new())));
        let scheduler = Scheduler::new(Arc::clone(&executor));
        let factory: JobFactory = Arc::new(|| Ok(Job::new("m", "m", Box::new(ManualTrigger::new()))));
        assert!(scheduler.schedule(factory).unwrap().is_none());
        assert!(!executor.is_running("m"));
    }
}
