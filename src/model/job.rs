use crate::action::Action;
use crate::trigger::Trigger;

/// Default number of execution records kept per job.
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// A configured, triggerable unit of work composed of tasks.
///
/// A job is a fully materialized graph: its trigger, tasks, actions and the
/// connectors those actions hold are already bound. One `Job` value backs one
/// run; callers materialize a fresh instance per run.
pub struct Job {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Execution records kept once this run has been archived.
    pub history_limit: usize,
    /// Items retained per action when the job is simulated. `None` uses the
    /// engine's configured limit.
    pub simulation_limit: Option<usize>,
    pub trigger: Box<dyn Trigger>,
    pub tasks: Vec<Task>,
}

impl Job {
    pub fn new(id: impl Into<String>, name: impl Into<String>, trigger: Box<dyn Trigger>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            simulation_limit: None,
            trigger,
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.active)
            .field("trigger", &self.trigger.kind())
            .field("tasks", &self.tasks)
            .finish()
    }
}

/// An ordered pipeline of actions within a job.
pub struct Task {
    pub id: String,
    pub name: String,
    pub actions: Vec<Box<dyn Action>>,
    /// How many data items may be processed in parallel. `None` is unbounded.
    pub concurrency: Option<usize>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            actions: Vec::new(),
            concurrency: None,
        }
    }

    pub fn with_action(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    /// Parallelism honoring the strictest active action override.
    pub fn effective_parallelism(&self) -> Option<usize> {
        self.actions
            .iter()
            .filter(|action| action.meta().active)
            .filter_map(|action| action.max_parallelism())
            .chain(self.concurrency)
            .min()
            .map(|limit| limit.max(1))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(|a| a.meta().name.as_str()).collect();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("actions", &actions)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}
