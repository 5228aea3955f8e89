//! Engine configuration loaded from `jobflow.toml`.
//!
//! [`EngineConfig`] holds every tunable of the executor and the simulator.
//! Keys missing from the file use the defaults below. The environment
//! variable `JOBFLOW_MAX_PARALLEL_JOBS` takes precedence over the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::simulation::SimulationConfig;

pub const CONFIG_FILE: &str = "jobflow.toml";
pub const MAX_PARALLEL_JOBS_ENV: &str = "JOBFLOW_MAX_PARALLEL_JOBS";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Size of the job-run worker pool.
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,

    /// Size of the simulation worker pool.
    #[serde(default = "default_max_parallel_simulations")]
    pub max_parallel_simulations: usize,

    /// Result items retained per action during a simulation.
    #[serde(default = "default_simulation_limit")]
    pub simulation_limit: usize,

    /// Simulations older than this are cancelled by the reaper.
    #[serde(default = "default_simulation_timeout_secs")]
    pub simulation_timeout_secs: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Execution records kept per job when a definition sets no limit.
    #[serde(default = "default_history_limit")]
    pub default_history_limit: usize,
}

fn default_max_parallel_jobs() -> usize {
    5
}

fn default_max_parallel_simulations() -> usize {
    2
}

fn default_simulation_limit() -> usize {
    25
}

fn default_simulation_timeout_secs() -> u64 {
    60
}

fn default_reaper_interval_secs() -> u64 {
    1
}

fn default_history_limit() -> usize {
    crate::model::DEFAULT_HISTORY_LIMIT
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
            max_parallel_simulations: default_max_parallel_simulations(),
            simulation_limit: default_simulation_limit(),
            simulation_timeout_secs: default_simulation_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            default_history_limit: default_history_limit(),
        }
    }
}

impl EngineConfig {
    /// Loads `jobflow.toml` from the working directory, or defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE), false)
    }

    /// Loads `path`. With `required` a missing file is an error.
    pub fn load_from(path: &Path, required: bool) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::parse(&contents).with_context(|| format!("parsing {}", path.display()))?
        } else if required {
            anyhow::bail!("config file {} not found", path.display());
        } else {
            Self::default()
        };

        config.with_env_override(std::env::var(MAX_PARALLEL_JOBS_ENV).ok().as_deref())
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str::<EngineConfig>(contents)?)
    }

    /// Applies the value of `JOBFLOW_MAX_PARALLEL_JOBS`, if set.
    pub fn with_env_override(mut self, max_parallel_jobs: Option<&str>) -> Result<Self> {
        if let Some(value) = max_parallel_jobs
            && !value.trim().is_empty()
        {
            self.max_parallel_jobs = value
                .trim()
                .parse()
                .with_context(|| format!("{MAX_PARALLEL_JOBS_ENV} must be a number, got '{value}'"))?;
        }
        Ok(self)
    }

    pub fn simulation(&self) -> SimulationConfig {
        SimulationConfig {
            max_parallel: self.max_parallel_simulations,
            limit: self.simulation_limit,
            timeout: Duration::from_secs(self.simulation_timeout_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs.max(1)),
        }
    }
}
