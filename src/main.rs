use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Map, Value};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobflow::cli::{Cli, Command};
use jobflow::config::EngineConfig;
use jobflow::EngineError;
use jobflow::engine::{JobExecutor, JobFactory, Scheduler};
use jobflow::model::ExecutionState;
use jobflow::registry::{JobDefinition, JobFile, Registry};
use jobflow::simulation::JobSimulator;
use jobflow::store::InMemoryExecutionStore;
use jobflow::ui::{self, JobProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path, true)?,
        None => EngineConfig::load()?,
    };
    if let Some(max_parallel_jobs) = cli.max_parallel_jobs {
        config.max_parallel_jobs = max_parallel_jobs;
    }
    let mut registry = Registry::with_builtins();

    match cli.command {
        Command::Run { definition, job } => run(&config, &mut registry, &definition, job.as_deref()).await,
        Command::Simulate {
            definition,
            job,
            limit,
            event_stdin,
        } => simulate(&config, &mut registry, &definition, job.as_deref(), limit, event_stdin).await,
        Command::Schedule {
            definition,
            event_stdin,
        } => schedule(&config, &mut registry, &definition, event_stdin).await,
        Command::Validate { definition, offline } => validate(&config, &mut registry, &definition, offline).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the job definitions of `path` and shares its `[[connector]]` entries
/// through `registry`.
fn load_definitions(
    config: &EngineConfig,
    registry: &mut Registry,
    path: &Path,
    only: Option<&str>,
) -> Result<Vec<JobDefinition>> {
    let file = JobFile::load(path).with_context(|| format!("loading {}", path.display()))?;
    registry.share_definitions(&file.connectors)?;
    let mut definitions: Vec<JobDefinition> = file
        .jobs
        .into_iter()
        .filter(|definition| only.is_none_or(|id| definition.id == id))
        .collect();
    if definitions.is_empty() {
        match only {
            Some(id) => return Err(EngineError::JobNotFound(id.to_string()).into()),
            None => bail!("no jobs defined in {}", path.display()),
        }
    }
    for definition in &mut definitions {
        definition.history_limit.get_or_insert(config.default_history_limit);
    }
    Ok(definitions)
}

async fn run(config: &EngineConfig, registry: &mut Registry, path: &Path, only: Option<&str>) -> Result<()> {
    let executor = JobExecutor::new(config.max_parallel_jobs, Arc::new(InMemoryExecutionStore::new()));

    let mut handles = Vec::new();
    for definition in load_definitions(config, registry, path, only)? {
        if !definition.active {
            warn!(job = %definition.id, "skipping inactive job");
            continue;
        }
        let job = registry.build_job(&definition)?;
        if job.trigger.is_event_driven() {
            warn!(job = %job.id, "skipping event-triggered job, use `schedule` or `simulate`");
            continue;
        }
        handles.push(executor.run_job(job)?);
    }

    let mut failed = 0;
    for handle in handles {
        let execution = Arc::clone(handle.execution());
        let progress = JobProgress::start(&execution.snapshot().job_name);
        tokio::select! {
            _ = progress.follow(Arc::clone(&execution)) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, cancelling");
                execution.cancel();
            }
        }
        let record = handle.wait().await?;
        progress.complete(&record);
        progress.print_record(&record);
        if record.state == ExecutionState::Failed {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{failed} job(s) failed");
    }
    Ok(())
}

async fn simulate(
    config: &EngineConfig,
    registry: &mut Registry,
    path: &Path,
    only: Option<&str>,
    limit: Option<usize>,
    event_stdin: bool,
) -> Result<()> {
    let event = if event_stdin { Some(read_event()?) } else { None };
    let simulator = Arc::new(JobSimulator::new(config.simulation()));
    let reaper = simulator.start_reaper();

    for definition in load_definitions(config, registry, path, only)? {
        let mut job = registry.build_job(&definition)?;
        if limit.is_some() {
            job.simulation_limit = limit;
        }
        let event_driven = job.trigger.is_event_driven();

        let progress = JobProgress::start(&format!("simulating {}", job.name));
        let handle = simulator.simulate_job(job);
        if event_driven {
            match &event {
                Some(payload) => {
                    simulator.on_inbound_event(&definition.id, payload.clone()).await;
                }
                None => info!(job = %definition.id, "waiting for events until the simulation times out"),
            }
        }
        let report = handle.result().await?;
        progress.complete_simulation(&report);
        progress.print_simulation(&report);
    }

    reaper.cancel();
    Ok(())
}

fn read_event() -> Result<Map<String, Value>> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    match serde_json::from_str::<Value>(&input).context("event on stdin is not JSON")? {
        Value::Object(payload) => Ok(payload),
        _ => bail!("event on stdin must be a JSON object"),
    }
}

async fn schedule(config: &EngineConfig, registry: &mut Registry, path: &Path, event_stdin: bool) -> Result<()> {
    let executor = Arc::new(JobExecutor::new(
        config.max_parallel_jobs,
        Arc::new(InMemoryExecutionStore::new()),
    ));
    let scheduler = Scheduler::new(Arc::clone(&executor));

    let mut event_jobs = Vec::new();
    for definition in load_definitions(config, registry, path, None)? {
        if !definition.active {
            continue;
        }
        let job_id = definition.id.clone();
        let factory: JobFactory = {
            let registry = registry.clone();
            Arc::new(move || registry.build_job(&definition))
        };
        scheduler.schedule(factory)?;
        if executor.is_running(&job_id) {
            event_jobs.push(job_id);
        }
    }

    info!("scheduler running, press Ctrl-C to stop");
    if event_stdin {
        let stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            routed = scheduler.route_events(stdin, &event_jobs) => {
                let delivered = routed?;
                info!("stdin closed after {delivered} event deliveries, press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
            }
            signal = tokio::signal::ctrl_c() => signal?,
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }
    scheduler.stop(&event_jobs);

    for (job_id, job_name) in executor.failed_jobs()? {
        ui::print_check(&format!("{job_name} ({job_id})"), Some("last execution FAILED"));
    }
    Ok(())
}

async fn validate(config: &EngineConfig, registry: &mut Registry, path: &Path, offline: bool) -> Result<()> {
    let mut problems = 0;
    for definition in load_definitions(config, registry, path, None)? {
        let subject = format!("job {}", definition.id);
        if let Err(err) = registry.build_job(&definition) {
            ui::print_check(&subject, Some(&err.to_string()));
            problems += 1;
            continue;
        }
        ui::print_check(&subject, None);

        if offline {
            continue;
        }
        for (connector, failure) in registry.test_connections(&definition).await? {
            let subject = format!("  connector {connector}");
            if failure.is_some() {
                problems += 1;
            }
            ui::print_check(&subject, failure.as_deref());
        }
    }

    if problems > 0 {
        bail!("{problems} problem(s) found");
    }
    Ok(())
}
