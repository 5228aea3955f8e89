//! Command line interface of `jobflow`, built on clap.
//!
//! [`Cli`] carries the [`Command`] subcommands (run, simulate, schedule,
//! validate) and the global flags (--config, --max-parallel-jobs, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// jobflow: runs and dry-runs action pipelines described in job files.
#[derive(Debug, Parser)]
#[command(name = "jobflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (defaults to ./jobflow.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the size of the job-run worker pool.
    #[arg(long, global = true)]
    pub max_parallel_jobs: Option<usize>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the jobs of a definition file once and prints their records.
    Run {
        /// TOML or JSON file with `job` definitions.
        definition: PathBuf,

        /// Runs only the job with this id.
        #[arg(long)]
        job: Option<String>,
    },

    /// Simulates the jobs of a definition file without side effects.
    Simulate {
        definition: PathBuf,

        #[arg(long)]
        job: Option<String>,

        /// Result items retained per action.
        #[arg(long)]
        limit: Option<usize>,

        /// Reads one JSON event from stdin for event-triggered jobs.
        #[arg(long, default_value_t = false)]
        event_stdin: bool,
    },

    /// Schedules interval, cron and event jobs until interrupted with Ctrl-C.
    Schedule {
        definition: PathBuf,

        /// Routes newline-delimited JSON events from stdin to the event jobs.
        /// A `job` key picks a single job.
        #[arg(long, default_value_t = false)]
        event_stdin: bool,
    },

    /// Builds every job and tests its connectors.
    Validate {
        definition: PathBuf,

        /// Skips the connector connection tests.
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
}
