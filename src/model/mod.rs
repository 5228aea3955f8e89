mod data;
mod execution;
mod job;
mod wip;

pub use data::{DATA_KEY, DataItem, META_KEY, SIMULATION_LOG_KEY};
pub use execution::{ExecutionRecord, ExecutionState, JobExecution};
pub use job::{DEFAULT_HISTORY_LIMIT, Job, Task};
pub use wip::{Progress, WorkInProgressMonitor};
