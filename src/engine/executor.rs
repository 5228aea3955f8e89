//! Admission and the bounded worker pool for real runs.
//!
//! `run_job` creates the execution record immediately and queues the run.
//! A dispatcher takes queued runs in submission order and starts each one
//! once a worker slot is free, so at most `max_parallel_jobs` runs execute at
//! the same time and the rest wait FIFO.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::job_runner::{EventPayload, JobRunner, forward_events};
use crate::error::{EngineError, error_cause};
use crate::model::{ExecutionRecord, ExecutionState, Job, JobExecution};
use crate::store::{ExecutionStore, Page};

/// Inbound events buffered per active event-driven run.
const EVENT_QUEUE: usize = 64;

/// A queued or running execution.
pub struct ExecutionHandle {
    execution: Arc<JobExecution>,
    done: oneshot::Receiver<ExecutionRecord>,
}

impl ExecutionHandle {
    pub fn execution(&self) -> &Arc<JobExecution> {
        &self.execution
    }

    pub fn cancel(&self) -> bool {
        self.execution.cancel()
    }

    /// Waits until the run ended and its record was archived.
    pub async fn wait(self) -> Result<ExecutionRecord, EngineError> {
        let job_id = self.execution.job_id();
        self.done.await.map_err(|_| EngineError::Dropped(job_id))
    }
}

struct QueuedRun {
    job: Job,
    execution: Arc<JobExecution>,
    events: Option<mpsc::Receiver<EventPayload>>,
    done: oneshot::Sender<ExecutionRecord>,
}

struct ActiveRun {
    execution: Arc<JobExecution>,
    events: Option<mpsc::Sender<EventPayload>>,
}

struct Shared {
    workers: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveRun>>,
    store: Arc<dyn ExecutionStore>,
}

/// Runs jobs on a bounded pool and archives their records.
pub struct JobExecutor {
    queue: mpsc::UnboundedSender<QueuedRun>,
    shared: Arc<Shared>,
}

impl JobExecutor {
    /// Starts the dispatcher. Must be called inside a Tokio runtime.
    pub fn new(max_parallel_jobs: usize, store: Arc<dyn ExecutionStore>) -> Self {
        let shared = Arc::new(Shared {
            workers: Arc::new(Semaphore::new(max_parallel_jobs.max(1))),
            active: Mutex::new(HashMap::new()),
            store,
        });
        let (queue, pending) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::clone(&shared), pending));
        Self { queue, shared }
    }

    /// Admits a run of `job`.
    ///
    /// Fails with [`EngineError::JobAlreadyRunning`] while an earlier run of
    /// the same job is queued or running.
    pub fn run_job(&self, job: Job) -> Result<ExecutionHandle, EngineError> {
        if !job.active {
            return Err(EngineError::Config(format!("job '{}' is not active", job.id)));
        }

        let mut active = self.shared.active.lock();
        if active.contains_key(&job.id) {
            return Err(EngineError::JobAlreadyRunning(job.id));
        }

        let execution = Arc::new(JobExecution::new(&job.id, &job.name));
        let (events_tx, events_rx) = if job.trigger.is_event_driven() {
            let (tx, rx) = mpsc::channel(EVENT_QUEUE);
            if let Some(source) = job.trigger.event_source() {
                forward_events(job.id.clone(), source, tx.clone(), Arc::clone(&execution));
            }
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (done_tx, done_rx) = oneshot::channel();

        active.insert(
            job.id.clone(),
            ActiveRun {
                execution: Arc::clone(&execution),
                events: events_tx,
            },
        );
        drop(active);

        debug!(job = %job.id, execution = %execution.id(), "queued job");
        let queued = QueuedRun {
            job,
            execution: Arc::clone(&execution),
            events: events_rx,
            done: done_tx,
        };
        if let Err(mpsc::error::SendError(run)) = self.queue.send(queued) {
            self.shared.active.lock().remove(&run.job.id);
            return Err(EngineError::Dropped(run.job.id));
        }

        Ok(ExecutionHandle {
            execution,
            done: done_rx,
        })
    }

    /// Cancels the active run of `job_id`, queued or running.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let execution = match self.shared.active.lock().get(job_id) {
            Some(run) => Arc::clone(&run.execution),
            None => return false,
        };
        info!(job = %job_id, "cancelling job");
        execution.cancel()
    }

    /// Routes an inbound event to the active run of an event-driven job.
    /// Returns false when no such run exists.
    pub async fn on_inbound_event(&self, job_id: &str, payload: EventPayload) -> bool {
        let sender = match self.shared.active.lock().get(job_id) {
            Some(ActiveRun {
                events: Some(sender),
                ..
            }) => sender.clone(),
            _ => return false,
        };
        sender.send(payload).await.is_ok()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.shared.active.lock().contains_key(job_id)
    }

    /// Snapshots of every queued or running execution.
    pub fn active_executions(&self) -> Vec<ExecutionRecord> {
        self.shared
            .active
            .lock()
            .values()
            .map(|run| run.execution.snapshot())
            .collect()
    }

    pub fn history(
        &self,
        job_id: &str,
        state: Option<ExecutionState>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<ExecutionRecord>, EngineError> {
        self.shared.store.load_history(job_id, state, offset, limit)
    }

    /// `(job id, job name)` of jobs whose latest execution FAILED.
    pub fn failed_jobs(&self) -> Result<Vec<(String, String)>, EngineError> {
        self.shared.store.failed_jobs()
    }
}

async fn dispatch(shared: Arc<Shared>, mut pending: mpsc::UnboundedReceiver<QueuedRun>) {
    while let Some(run) = pending.recv().await {
        let permit = match Arc::clone(&shared.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            execute(&shared, run).await;
        });
    }
    debug!("executor dispatcher stopped");
}

async fn execute(shared: &Shared, run: QueuedRun) {
    let QueuedRun {
        job,
        execution,
        events,
        done,
    } = run;
    let job_id = job.id.clone();
    let history_limit = job.history_limit;

    let worker = {
        let execution = Arc::clone(&execution);
        tokio::spawn(async move { JobRunner::new().run(Arc::new(job), execution, events).await })
    };
    let record = match worker.await {
        Ok(record) => record,
        Err(err) => {
            let err = EngineError::from(err);
            error!(job = %job_id, "job worker panicked: {err}");
            execution.fail(error_cause(&err));
            execution.snapshot()
        }
    };

    shared.active.lock().remove(&job_id);
    archive(shared.store.as_ref(), &record, history_limit);

    if done.send(record).is_err() {
        debug!(job = %job_id, "nobody waiting for execution result");
    }
}

fn archive(store: &dyn ExecutionStore, record: &ExecutionRecord, history_limit: usize) {
    if let Err(err) = store.save(record) {
        error!(job = %record.job_id, "failed to save execution record: {err}");
        return;
    }
    match store.apply_retention(&record.job_id, history_limit) {
        Ok(0) => {}
        Ok(evicted) => debug!(job = %record.job_id, evicted, "evicted old execution records"),
        Err(err) => warn!(job = %record.job_id, "failed to apply history limit: {err}"),
    }
}
