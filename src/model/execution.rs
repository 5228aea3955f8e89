use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::wip::WorkInProgressMonitor;

/// The states of a job execution.
///
/// Each run flows RUNNING → FINISHED | CANCELLED | FAILED. The three terminal
/// states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Running)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Running => write!(f, "RUNNING"),
            ExecutionState::Finished => write!(f, "FINISHED"),
            ExecutionState::Cancelled => write!(f, "CANCELLED"),
            ExecutionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Point-in-time view of one job run. This is what gets persisted and shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub state: ExecutionState,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub error_cause: Option<String>,
    /// Events consumed by an event-triggered run.
    pub processed_events: u64,
    pub duration_ms: Option<i64>,
}

/// The live, shared execution record of one run.
///
/// Mutated by the owning job runner and by cancel requests. Once the state
/// leaves RUNNING every further transition is ignored, so a cancel racing the
/// runner's completion resolves to whichever terminal state landed first.
#[derive(Debug)]
pub struct JobExecution {
    record: Mutex<ExecutionRecord>,
    cancel: CancellationToken,
}

impl JobExecution {
    pub fn new(job_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            record: Mutex::new(ExecutionRecord {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.into(),
                job_name: job_name.into(),
                state: ExecutionState::Running,
                created: Utc::now(),
                started: None,
                finished: None,
                current_task: None,
                error_cause: None,
                processed_events: 0,
                duration_ms: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> String {
        self.record.lock().id.clone()
    }

    pub fn job_id(&self) -> String {
        self.record.lock().job_id.clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.record.lock().state
    }

    pub fn snapshot(&self) -> ExecutionRecord {
        self.record.lock().clone()
    }

    /// True for every state except RUNNING: the pipeline's single "stop now" check.
    pub fn is_cancelled(&self) -> bool {
        self.state().is_terminal()
    }

    /// Stamps the moment a worker actually picked the run up.
    pub fn mark_started(&self) {
        let mut record = self.record.lock();
        if record.started.is_none() {
            record.started = Some(Utc::now());
        }
    }

    pub fn set_current_task(&self, name: &str) {
        let mut record = self.record.lock();
        if !record.state.is_terminal() {
            record.current_task = Some(name.to_string());
        }
    }

    pub fn increment_processed_events(&self) {
        let mut record = self.record.lock();
        if !record.state.is_terminal() {
            record.processed_events += 1;
        }
    }

    /// RUNNING → CANCELLED. Returns false if the record was already terminal.
    pub fn cancel(&self) -> bool {
        let applied = self.terminate(ExecutionState::Cancelled, None);
        // Wakes cooperative waiters even when another terminal state won.
        self.cancel.cancel();
        applied
    }

    /// RUNNING → FAILED with the given cause.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let applied = self.terminate(ExecutionState::Failed, Some(cause.into()));
        self.cancel.cancel();
        applied
    }

    /// RUNNING → FINISHED.
    pub fn finish(&self) -> bool {
        self.terminate(ExecutionState::Finished, None)
    }

    fn terminate(&self, state: ExecutionState, cause: Option<String>) -> bool {
        let mut record = self.record.lock();
        if record.state.is_terminal() {
            return false;
        }
        let now = Utc::now();
        record.state = state;
        record.error_cause = cause;
        record.finished = Some(now);
        record.duration_ms = record
            .started
            .map(|started| (now - started).num_milliseconds());
        true
    }

    /// Resolves once the run is cancelled or failed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Creates a progress monitor tied to this run's cancellation.
    pub fn work_in_progress(&self, name: impl Into<String>) -> WorkInProgressMonitor {
        WorkInProgressMonitor::with_token(name, self.cancel.child_token())
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
