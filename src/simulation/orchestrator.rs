//! Runs jobs as dry-run simulations.
//!
//! A simulated job gets its trigger and actions sandboxed and its actions
//! wrapped in recorders before it is handed to a simulation-mode
//! [`JobRunner`]. Simulations run on their own bounded pool, are never
//! archived, and are cancelled by the reaper once they exceed the timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::interception::{InterceptedCall, Sandbox};
use super::recorder::{ActionSimulation, RecordingAction};
use crate::action::Action;
use crate::engine::job_runner::forward_events;
use crate::engine::{EventPayload, JobRunner};
use crate::error::EngineError;
use crate::model::{ExecutionState, Job, JobExecution};

/// Events an event-driven simulation buffers before senders wait.
const EVENT_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Simulations that may run at the same time.
    pub max_parallel: usize,
    /// Items retained per action unless the job sets its own limit.
    pub limit: usize,
    /// Age after which the reaper cancels a simulation.
    pub timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            limit: 25,
            timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of one task within a simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSimulation {
    pub task_id: String,
    pub task_name: String,
    /// Set on the task the run failed in.
    pub error_cause: Option<String>,
    pub actions: Vec<ActionSimulation>,
}

/// Everything a simulation produced. Returned to the caller and discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub simulation_id: String,
    pub job_id: String,
    pub job_name: String,
    pub state: ExecutionState,
    pub error_cause: Option<String>,
    pub processed_events: u64,
    pub tasks: Vec<TaskSimulation>,
    /// Connector calls that were suppressed.
    pub intercepted: Vec<InterceptedCall>,
}

impl SimulationReport {
    pub fn task(&self, name: &str) -> Option<&TaskSimulation> {
        self.tasks.iter().find(|task| task.task_name == name)
    }
}

/// A simulation in progress.
pub struct SimulationHandle {
    pub id: String,
    pub job_id: String,
    execution: Arc<JobExecution>,
    worker: JoinHandle<SimulationReport>,
}

impl SimulationHandle {
    pub fn execution(&self) -> &Arc<JobExecution> {
        &self.execution
    }

    pub fn cancel(&self) -> bool {
        self.execution.cancel()
    }

    pub async fn result(self) -> Result<SimulationReport, EngineError> {
        Ok(self.worker.await?)
    }
}

struct ActiveSimulation {
    id: String,
    job_id: String,
    execution: Arc<JobExecution>,
    events: Option<mpsc::Sender<EventPayload>>,
    registered: Instant,
}

/// Removes a simulation from the active list when its worker ends, panics
/// included. A record still open at that point is failed.
struct Registration {
    id: String,
    execution: Arc<JobExecution>,
    active: Arc<Mutex<Vec<ActiveSimulation>>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.execution.fail("simulation worker stopped unexpectedly") {
            warn!(simulation = %self.id, "simulation worker stopped without a result");
        }
        self.active.lock().retain(|simulation| simulation.id != self.id);
    }
}

struct TaskSlots {
    task_id: String,
    task_name: String,
    actions: Vec<Arc<Mutex<ActionSimulation>>>,
}

pub struct JobSimulator {
    config: SimulationConfig,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<Vec<ActiveSimulation>>>,
}

impl JobSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            active: Arc::new(Mutex::new(Vec::new())),
            config,
        }
    }

    /// Starts a simulation of `job` on the simulation pool.
    pub fn simulate_job(&self, mut job: Job) -> SimulationHandle {
        let id = Uuid::new_v4().to_string();
        let limit = job.simulation_limit.unwrap_or(self.config.limit);
        let sandbox = Sandbox::new();
        job.trigger.sandbox(&sandbox);

        let mut slots = Vec::with_capacity(job.tasks.len());
        for task in &mut job.tasks {
            let mut results = Vec::with_capacity(task.actions.len());
            task.actions = std::mem::take(&mut task.actions)
                .into_iter()
                .map(|mut action| {
                    action.sandbox(&sandbox);
                    let recorder = RecordingAction::new(action, limit);
                    results.push(recorder.result());
                    Box::new(recorder) as Box<dyn Action>
                })
                .collect();
            slots.push(TaskSlots {
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                actions: results,
            });
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
        self.active.lock().push(ActiveSimulation {
            id: id.clone(),
            job_id: job.id.clone(),
            execution: Arc::clone(&execution),
            events: events_tx,
            registered: Instant::now(),
        });
        info!(job = %job.id, simulation = %id, "starting simulation");

        let job_id = job.id.clone();
        let worker = {
            let id = id.clone();
            let execution = Arc::clone(&execution);
            let permits = Arc::clone(&self.permits);
            let registration = Registration {
                id: id.clone(),
                execution: Arc::clone(&execution),
                active: Arc::clone(&self.active),
            };
            tokio::spawn(async move {
                let record = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        JobRunner::simulation()
                            .with_event_budget(Some(1))
                            .run(Arc::new(job), Arc::clone(&execution), events_rx)
                            .await
                    }
                    Err(_) => {
                        execution.fail("simulation pool closed");
                        execution.snapshot()
                    }
                };
                drop(registration);
                debug!(simulation = %id, state = %record.state, "simulation ended");

                let failed_task = match record.state {
                    ExecutionState::Failed => record.current_task.clone(),
                    _ => None,
                };
                let tasks = slots
                    .into_iter()
                    .map(|slot| TaskSimulation {
                        error_cause: failed_task
                            .as_deref()
                            .filter(|name| *name == slot.task_name)
                            .and(record.error_cause.clone()),
                        task_id: slot.task_id,
                        task_name: slot.task_name,
                        actions: slot.actions.iter().map(|result| result.lock().clone()).collect(),
                    })
                    .collect();

                SimulationReport {
                    simulation_id: id,
                    job_id: record.job_id,
                    job_name: record.job_name,
                    state: record.state,
                    error_cause: record.error_cause,
                    processed_events: record.processed_events,
                    tasks,
                    intercepted: sandbox.intercepted(),
                }
            })
        };

        SimulationHandle {
            id,
            job_id,
            execution,
            worker,
        }
    }

    /// Cancels every active simulation of `job_id`. Returns how many.
    pub fn cancel_simulations(&self, job_id: &str) -> usize {
        let executions: Vec<Arc<JobExecution>> = self
            .active
            .lock()
            .iter()
            .filter(|simulation| simulation.job_id == job_id)
            .map(|simulation| Arc::clone(&simulation.execution))
            .collect();
        let cancelled = executions.iter().filter(|execution| execution.cancel()).count();
        if cancelled > 0 {
            info!(job = %job_id, cancelled, "cancelled simulations");
        }
        cancelled
    }

    /// Routes an inbound event to the in-progress simulations of `job_id`.
    /// Returns how many received it; zero means the event was ignored.
    pub async fn on_inbound_event(&self, job_id: &str, payload: EventPayload) -> usize {
        let senders: Vec<mpsc::Sender<EventPayload>> = self
            .active
            .lock()
            .iter()
            .filter(|simulation| simulation.job_id == job_id)
            .filter_map(|simulation| simulation.events.clone())
            .collect();
        if senders.is_empty() {
            debug!(job = %job_id, "no simulation waiting for event, ignoring");
            return 0;
        }

        let mut routed = 0;
        for sender in senders {
            if sender.send(payload.clone()).await.is_ok() {
                routed += 1;
            }
        }
        debug!(job = %job_id, routed, "routed event to simulations");
        routed
    }

    /// Cancels simulations registered longer than the timeout ago.
    pub fn reap_stale(&self) -> usize {
        let stale: Vec<(String, Arc<JobExecution>)> = self
            .active
            .lock()
            .iter()
            .filter(|simulation| simulation.registered.elapsed() >= self.config.timeout)
            .map(|simulation| (simulation.id.clone(), Arc::clone(&simulation.execution)))
            .collect();

        let mut reaped = 0;
        for (id, execution) in stale {
            if execution.cancel() {
                info!(simulation = %id, job = %execution.job_id(), "cancelled stale simulation");
                reaped += 1;
            }
        }
        reaped
    }

    /// Runs [`reap_stale`](Self::reap_stale) every reaper interval until the
    /// returned token is cancelled.
    pub fn start_reaper(self: &Arc<Self>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let simulator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(simulator.config.reaper_interval) => {
                        simulator.reap_stale();
                    }
                }
            }
            debug!("simulation reaper stopped");
        });
        cancel
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
