//! Dry-run execution: connector interception, per-action result capture and
//! the simulation orchestrator.

pub mod interception;
pub mod orchestrator;
mod recorder;

pub use interception::{InterceptedCall, Sandbox};
pub use orchestrator::{
    JobSimulator, SimulationConfig, SimulationHandle, SimulationReport, TaskSimulation,
};
pub use recorder::ActionSimulation;
