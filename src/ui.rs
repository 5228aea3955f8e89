//! Terminal output: spinners and colored summaries.
//!
//! Uses `indicatif` for progress spinners and `console` for styling.
//! [`JobProgress`] follows one execution or simulation in the terminal.

use std::sync::Arc;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::model::{ExecutionRecord, ExecutionState, JobExecution};
use crate::simulation::SimulationReport;

/// Spinner for a job run. Green for FINISHED, red for FAILED, yellow for
/// CANCELLED.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("QUEUED: {label}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Refreshes the spinner from the live record until the run ends.
    pub async fn follow(&self, execution: Arc<JobExecution>) {
        loop {
            let record = execution.snapshot();
            if record.state.is_terminal() {
                break;
            }
            let phase = if record.started.is_some() { "RUNNING" } else { "QUEUED" };
            let task = record.current_task.as_deref().unwrap_or("-");
            self.pb
                .set_message(format!("{phase}: {} (task: {task})", record.job_name));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn complete(&self, record: &ExecutionRecord) {
        let failure = record.error_cause.as_deref().map(|cause| {
            format!(
                "in task {}: {cause}",
                record.current_task.as_deref().unwrap_or("-")
            )
        });
        self.summarize(&record.job_name, record.state, failure.as_deref());
    }

    pub fn complete_simulation(&self, report: &SimulationReport) {
        let subject = format!("{} (simulation)", report.job_name);
        self.summarize(&subject, report.state, report.error_cause.as_deref());
    }

    fn summarize(&self, subject: &str, state: ExecutionState, failure: Option<&str>) {
        self.pb.finish_and_clear();
        let style = self.style_for(state);
        match state {
            ExecutionState::Finished => println!("  {} {subject} finished", style.apply_to("✓")),
            ExecutionState::Failed => println!(
                "  {} {subject} failed {}",
                style.apply_to("✗"),
                failure.unwrap_or("with unknown cause")
            ),
            ExecutionState::Cancelled => println!("  {} {subject} cancelled", style.apply_to("⊘")),
            ExecutionState::Running => println!("  {} {subject} still running", style.apply_to("…")),
        }
    }

    /// Prints the execution record as pretty JSON.
    pub fn print_record(&self, record: &ExecutionRecord) {
        self.print_json("─── Execution Record ───", record.state, record);
    }

    pub fn print_simulation(&self, report: &SimulationReport) {
        self.print_json("─── Simulation Report ───", report.state, report);
    }

    fn print_json<T: Serialize>(&self, title: &str, state: ExecutionState, value: &T) {
        println!();
        println!("{}", self.style_for(state).apply_to(title));
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }

    fn style_for(&self, state: ExecutionState) -> &Style {
        match state {
            ExecutionState::Finished => &self.green,
            ExecutionState::Failed => &self.red,
            _ => &self.yellow,
        }
    }
}

/// Prints one validation line: a green check or a red cross with the reason.
pub fn print_check(subject: &str, failure: Option<&str>) {
    match failure {
        None => println!("  {} {subject}", Style::new().green().bold().apply_to("✓")),
        Some(reason) => println!("  {} {subject}: {reason}", Style::new().red().bold().apply_to("✗")),
    }
}
