//! Real execution: task pipelines, job runs, the bounded executor and the
//! trigger scheduler.

pub mod executor;
pub mod job_runner;
pub mod scheduler;
pub mod task_runner;

pub use executor::{ExecutionHandle, JobExecutor};
pub use job_runner::{EventPayload, JobRunner};
pub use scheduler::{JobFactory, Scheduler};
pub use task_runner::{TaskReport, run_task};
