use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use jobflow::action::file::{DeleteFileAction, ListFilesAction, MoveFileAction, TransferParams};
use jobflow::action::util::{DuplicateAction, PauseAction, SkipAction};
use jobflow::action::{Action, ActionMeta, ExecutionContext};
use jobflow::connector::{FileConnector, LocalFsConnector};
use jobflow::engine::{JobExecutor, run_task};
use jobflow::model::{DataItem, ExecutionState, Job, JobExecution, Task};
use jobflow::registry::{JobFile, Registry};
use jobflow::simulation::{JobSimulator, SimulationConfig};
use jobflow::store::InMemoryExecutionStore;
use jobflow::trigger::ManualTrigger;
use jobflow::ActionError;

/// Counts invocations and optionally fails each of them.
struct Tally {
    meta: ActionMeta,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl Tally {
    fn new(name: &str, calls: &Arc<AtomicUsize>) -> Self {
        Self {
            meta: ActionMeta::new(name),
            calls: Arc::clone(calls),
            fail: false,
        }
    }

    fn failing(name: &str, calls: &Arc<AtomicUsize>) -> Self {
        Self {
            fail: true,
            ..Self::new(name, calls)
        }
    }
}

#[async_trait]
impl Action for Tally {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(&self, item: DataItem, _: &ExecutionContext) -> Result<Vec<DataItem>, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ActionError::Io(std::io::Error::other("disk full")));
        }
        Ok(vec![item])
    }
}

fn executor() -> JobExecutor {
    JobExecutor::new(2, Arc::new(InMemoryExecutionStore::new()))
}

fn context(job: &Job) -> ExecutionContext {
    ExecutionContext {
        job_id: job.id.clone(),
        task_id: job.tasks[0].id.clone(),
        task_name: job.tasks[0].name.clone(),
        execution: Arc::new(JobExecution::new(&job.id, &job.name)),
        simulation: false,
    }
}

fn item(n: i64) -> DataItem {
    let mut item = DataItem::new();
    item.data_mut().insert("n".into(), json!(n));
    item
}

fn file_item(directory: &str, filename: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("directory".into(), json!(directory));
    data.insert("filename".into(), json!(filename));
    data
}

#[tokio::test]
async fn skip_first_two_of_three_items() {
    let job = Arc::new(
        Job::new("skip", "Skip", Box::new(ManualTrigger::new()))
            .with_task(Task::new("t1", "skip").with_action(SkipAction::new(ActionMeta::new("skip"), 2))),
    );
    let ctx = context(&job);

    let report = run_task(&job, 0, vec![item(1), item(2), item(3)], &ctx).await.unwrap();
    assert_eq!(report.outputs, vec![item(3)]);
    assert_eq!(report.processed, 3);
}

#[tokio::test]
async fn duplicate_yields_three_equal_items() {
    let job = Arc::new(
        Job::new("dup", "Dup", Box::new(ManualTrigger::new()))
            .with_task(Task::new("t1", "dup").with_action(DuplicateAction::new(ActionMeta::new("dup"), 3))),
    );
    let ctx = context(&job);

    let report = run_task(&job, 0, vec![item(7)], &ctx).await.unwrap();
    assert_eq!(report.outputs, vec![item(7), item(7), item(7)]);
}

#[tokio::test]
async fn fan_out_items_are_processed_independently() {
    let calls = Arc::new(AtomicUsize::new(0));
    let job = Arc::new(
        Job::new("fan", "Fan", Box::new(ManualTrigger::new())).with_task(
            Task::new("t1", "fan")
                .with_concurrency(2)
                .with_action(DuplicateAction::new(ActionMeta::new("dup"), 4))
                .with_action(Tally::new("count", &calls)),
        ),
    );
    let ctx = context(&job);

    let report = run_task(&job, 0, vec![item(1), item(2)], &ctx).await.unwrap();
    assert_eq!(report.outputs.len(), 8);
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn failing_task_stops_later_tasks() {
    let calls = Arc::new(AtomicUsize::new(0));
    let later = Arc::new(AtomicUsize::new(0));
    let job = Job::new("fail", "Fail", Box::new(ManualTrigger::new()))
        .with_task(Task::new("t1", "first").with_action(Tally::new("a", &calls)))
        .with_task(Task::new("t2", "second").with_action(Tally::failing("b", &calls)))
        .with_task(Task::new("t3", "third").with_action(Tally::new("c", &later)));

    let executor = executor();
    let record = executor.run_job(job).unwrap().wait().await.unwrap();

    assert_eq!(record.state, ExecutionState::Failed);
    assert_eq!(record.current_task.as_deref(), Some("second"));
    assert_eq!(
        record.error_cause.as_deref(),
        Some("Task 'second' failed: IO error: disk full")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(
        executor.failed_jobs().unwrap(),
        vec![("fail".to_string(), "Fail".to_string())]
    );
}

#[tokio::test]
async fn cancel_while_second_of_three_tasks_runs() {
    let later = Arc::new(AtomicUsize::new(0));
    let job = Job::new("cancel", "Cancel", Box::new(ManualTrigger::new()))
        .with_task(Task::new("t1", "first"))
        .with_task(
            Task::new("t2", "second")
                .with_action(PauseAction::new(ActionMeta::new("wait"), Duration::from_secs(60))),
        )
        .with_task(Task::new("t3", "third").with_action(Tally::new("c", &later)));

    let executor = executor();
    let handle = executor.run_job(job).unwrap();
    let execution = Arc::clone(handle.execution());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(execution.snapshot().current_task.as_deref(), Some("second"));
    assert!(executor.cancel_job("cancel"));

    let record = handle.wait().await.unwrap();
    assert_eq!(record.state, ExecutionState::Cancelled);
    assert_eq!(record.current_task.as_deref(), Some("second"));
    assert_eq!(later.load(Ordering::SeqCst), 0);

    assert!(!execution.cancel());
    assert_eq!(execution.snapshot().finished, record.finished);
    assert!(!executor.cancel_job("cancel"));
}

#[tokio::test]
async fn simulated_move_leaves_files_untouched() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("inbox")).unwrap();
    std::fs::write(dir.path().join("inbox/a.txt"), "payload").unwrap();

    let fs: Arc<dyn FileConnector> = Arc::new(LocalFsConnector::new("local", dir.path()));
    let trigger = ManualTrigger {
        data: file_item("inbox", "a.txt"),
    };
    let job = Job::new("move", "Move", Box::new(trigger)).with_task(
        Task::new("t1", "archive").with_action(MoveFileAction::new(
            ActionMeta::new("move"),
            fs,
            TransferParams::to_directory("archive"),
        )),
    );

    let simulator = JobSimulator::new(SimulationConfig::default());
    let report = simulator.simulate_job(job).result().await.unwrap();

    assert_eq!(report.state, ExecutionState::Finished);
    assert!(dir.path().join("inbox/a.txt").exists());
    assert!(!dir.path().join("archive").exists());

    let produced = &report.task("archive").unwrap().actions[0].items;
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].lookup("data.directory"), Some(&json!("archive")));
    assert_eq!(produced[0].lookup("data.filename"), Some(&json!("a.txt")));
    assert_eq!(report.intercepted.len(), 1);
    assert_eq!(report.intercepted[0].operation, "move");
}

#[tokio::test]
async fn simulation_runs_safe_reads_and_blocks_deletes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("inbox")).unwrap();
    std::fs::write(dir.path().join("inbox/a.csv"), "1").unwrap();
    std::fs::write(dir.path().join("inbox/b.csv"), "2").unwrap();

    let fs: Arc<dyn FileConnector> = Arc::new(LocalFsConnector::new("local", dir.path()));
    let job = Job::new("purge", "Purge", Box::new(ManualTrigger::new())).with_task(
        Task::new("t1", "purge")
            .with_action(ListFilesAction::new(
                ActionMeta::new("list"),
                Arc::clone(&fs),
                "inbox",
                Some(".csv".into()),
            ))
            .with_action(DeleteFileAction::new(ActionMeta::new("delete"), fs)),
    );

    let report = JobSimulator::new(SimulationConfig::default())
        .simulate_job(job)
        .result()
        .await
        .unwrap();

    let task = &report.tasks[0];
    assert_eq!(task.actions[0].items.len(), 2);
    assert_eq!(task.actions[1].items.len(), 2);
    assert_eq!(report.intercepted.len(), 2);
    assert!(dir.path().join("inbox/a.csv").exists());
    assert!(dir.path().join("inbox/b.csv").exists());
}

#[tokio::test]
async fn simulation_scopes_failure_to_task_and_action() {
    let calls = Arc::new(AtomicUsize::new(0));
    let job = Job::new("sim-fail", "SimFail", Box::new(ManualTrigger::new()))
        .with_task(Task::new("t1", "ok").with_action(Tally::new("a", &calls)))
        .with_task(Task::new("t2", "broken").with_action(Tally::failing("b", &calls)));

    let report = JobSimulator::new(SimulationConfig::default())
        .simulate_job(job)
        .result()
        .await
        .unwrap();

    assert_eq!(report.state, ExecutionState::Failed);
    assert!(report.task("ok").unwrap().error_cause.is_none());
    let broken = report.task("broken").unwrap();
    assert!(broken.error_cause.is_some());
    assert_eq!(broken.actions[0].error_cause.as_deref(), Some("IO error: disk full"));
}

#[tokio::test]
async fn definition_file_runs_through_executor() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("in")).unwrap();
    std::fs::write(dir.path().join("in/report.csv"), "x").unwrap();
    let root = dir.path().to_string_lossy().replace('\\', "/");

    let definition = format!(
        r#"
[[job]]
id = "archive"
name = "Archive reports"

[job.trigger]
type = "manual"

[[job.connectors]]
id = "local"
type = "localfs"
root = "{root}"

[[job.tasks]]
name = "move"

[[job.tasks.actions]]
type = "list-files"
connector = "local"
directory = "in"

[[job.tasks.actions]]
type = "move-file"
connector = "local"
target_directory = "done"
"#
    );
    let file = JobFile::parse(&definition, false).unwrap();
    let job = Registry::with_builtins().build_job(&file.jobs[0]).unwrap();

    let record = executor().run_job(job).unwrap().wait().await.unwrap();
    assert_eq!(record.state, ExecutionState::Finished, "{:?}", record.error_cause);
    assert!(!dir.path().join("in/report.csv").exists());
    assert!(dir.path().join("done/report.csv").exists());
}
