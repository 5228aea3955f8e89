//! Job definitions and the factories that turn them into runnable jobs.
//!
//! Definitions are plain serde data read from TOML or JSON. The [`Registry`]
//! maps type identifiers to factory functions for triggers, connectors and
//! actions; it is filled once with the built-ins and never changes while
//! jobs are built from it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::file::{
    CopyFileAction, DeleteFileAction, ListFilesAction, MoveFileAction, ReadFileAction,
    TransferParams, WriteLinesFileAction,
};
use crate::action::message::SendMessageAction;
use crate::action::util::{
    AddDataAction, DuplicateAction, FilterByRegexAction, FilterByTimestampAction, LimitAction,
    LogAction, PauseAction, SkipAction, SplitArrayAction, TimestampFormat, time_span,
};
use crate::action::{Action, ActionMeta};
use crate::connector::{
    ChannelMessageConnector, Connector, FileConnector, LocalFsConnector, MessageConnector,
};
use crate::error::EngineError;
use crate::model::{DEFAULT_HISTORY_LIMIT, Job, Task};
use crate::trigger::{
    CronTrigger, EventTrigger, IntervalTrigger, ManualTrigger, MessageTrigger, Trigger,
};

fn default_true() -> bool {
    true
}

/// A file holding one or more `[[job]]` definitions and the `[[connector]]`
/// instances shared by all of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFile {
    #[serde(default, rename = "job")]
    pub jobs: Vec<JobDefinition>,
    #[serde(default, rename = "connector")]
    pub connectors: Vec<ConnectorDefinition>,
}

impl JobFile {
    /// Reads a `.json` file as JSON and anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path.extension().is_some_and(|ext| ext == "json"))
    }

    pub fn parse(content: &str, json: bool) -> Result<Self, EngineError> {
        if json {
            Ok(serde_json::from_str(content)?)
        } else {
            Ok(toml::from_str(content)?)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub history_limit: Option<usize>,
    #[serde(default)]
    pub simulation_limit: Option<usize>,
    pub trigger: TriggerDefinition,
    #[serde(default)]
    pub connectors: Vec<ConnectorDefinition>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// A connector built for one job instance.
#[derive(Clone)]
pub enum ConnectorInstance {
    File(Arc<dyn FileConnector>),
    Message(Arc<dyn MessageConnector>),
}

impl ConnectorInstance {
    fn as_connector(&self) -> &dyn Connector {
        match self {
            ConnectorInstance::File(connector) => connector.as_ref(),
            ConnectorInstance::Message(connector) => connector.as_ref(),
        }
    }
}

/// Connectors visible to the actions of one job.
#[derive(Clone, Default)]
pub struct Connectors {
    by_id: HashMap<String, ConnectorInstance>,
}

impl Connectors {
    pub fn file(&self, id: &str) -> Result<Arc<dyn FileConnector>, EngineError> {
        match self.by_id.get(id) {
            Some(ConnectorInstance::File(connector)) => Ok(Arc::clone(connector)),
            Some(_) => Err(EngineError::Config(format!("connector '{id}' is not a file connector"))),
            None => Err(EngineError::Config(format!("unknown connector '{id}'"))),
        }
    }

    pub fn message(&self, id: &str) -> Result<Arc<dyn MessageConnector>, EngineError> {
        match self.by_id.get(id) {
            Some(ConnectorInstance::Message(connector)) => Ok(Arc::clone(connector)),
            Some(_) => Err(EngineError::Config(format!(
                "connector '{id}' is not a message connector"
            ))),
            None => Err(EngineError::Config(format!("unknown connector '{id}'"))),
        }
    }
}

/// Typed access to the free-form parameters of a definition.
pub struct Params<'a> {
    owner: &'a str,
    values: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    pub fn new(owner: &'a str, values: &'a Map<String, Value>) -> Self {
        Self { owner, values }
    }

    fn missing(&self, key: &str) -> EngineError {
        EngineError::Config(format!("{}: missing parameter '{key}'", self.owner))
    }

    fn invalid(&self, key: &str, expected: &str) -> EngineError {
        EngineError::Config(format!("{}: parameter '{key}' must be {expected}", self.owner))
    }

    pub fn opt_str(&self, key: &str) -> Result<Option<String>, EngineError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    pub fn str(&self, key: &str) -> Result<String, EngineError> {
        self.opt_str(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn opt_u64(&self, key: &str) -> Result<Option<u64>, EngineError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "a non-negative integer")),
        }
    }

    pub fn usize(&self, key: &str) -> Result<usize, EngineError> {
        let value = self.opt_u64(key)?.ok_or_else(|| self.missing(key))?;
        usize::try_from(value).map_err(|_| self.invalid(key, "a smaller integer"))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, EngineError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(value)) => Ok(*value),
            Some(_) => Err(self.invalid(key, "a boolean")),
        }
    }

    pub fn object(&self, key: &str) -> Result<Map<String, Value>, EngineError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(value)) => Ok(value.clone()),
            Some(_) => Err(self.invalid(key, "a table")),
        }
    }
}

pub type TriggerFactory = fn(&Params<'_>, &Connectors) -> Result<Box<dyn Trigger>, EngineError>;
pub type ConnectorFactory = fn(&str, &Params<'_>) -> Result<ConnectorInstance, EngineError>;
pub type ActionFactory =
    fn(ActionMeta, &Params<'_>, &Connectors) -> Result<Box<dyn Action>, EngineError>;

/// Type identifier → factory maps for triggers, connectors and actions.
#[derive(Clone, Default)]
pub struct Registry {
    triggers: HashMap<String, TriggerFactory>,
    connectors: HashMap<String, ConnectorFactory>,
    actions: HashMap<String, ActionFactory>,
    shared: HashMap<String, ConnectorInstance>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in trigger, connector and action.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_trigger(ManualTrigger::TYPE_ID, manual_trigger);
        registry.register_trigger(IntervalTrigger::TYPE_ID, interval_trigger);
        registry.register_trigger(CronTrigger::TYPE_ID, cron_trigger);
        registry.register_trigger(EventTrigger::TYPE_ID, event_trigger);
        registry.register_trigger(MessageTrigger::TYPE_ID, message_trigger);

        registry.register_connector(LocalFsConnector::TYPE_ID, localfs_connector);
        registry.register_connector(ChannelMessageConnector::TYPE_ID, channel_connector);

        registry.register_action(SkipAction::TYPE_ID, skip_action);
        registry.register_action(LimitAction::TYPE_ID, limit_action);
        registry.register_action(DuplicateAction::TYPE_ID, duplicate_action);
        registry.register_action(AddDataAction::TYPE_ID, add_data_action);
        registry.register_action(FilterByRegexAction::TYPE_ID, filter_regex_action);
        registry.register_action(FilterByTimestampAction::TYPE_ID, filter_timestamp_action);
        registry.register_action(SplitArrayAction::TYPE_ID, split_array_action);
        registry.register_action(PauseAction::TYPE_ID, pause_action);
        registry.register_action(LogAction::TYPE_ID, log_action);
        registry.register_action(ListFilesAction::TYPE_ID, list_files_action);
        registry.register_action(ReadFileAction::TYPE_ID, read_file_action);
        registry.register_action(CopyFileAction::TYPE_ID, copy_file_action);
        registry.register_action(MoveFileAction::TYPE_ID, move_file_action);
        registry.register_action(DeleteFileAction::TYPE_ID, delete_file_action);
        registry.register_action(WriteLinesFileAction::TYPE_ID, write_lines_file_action);
        registry.register_action(SendMessageAction::TYPE_ID, send_message_action);
        registry
    }

    pub fn register_trigger(&mut self, type_id: &str, factory: TriggerFactory) {
        self.triggers.insert(type_id.to_string(), factory);
    }

    pub fn register_connector(&mut self, type_id: &str, factory: ConnectorFactory) {
        self.connectors.insert(type_id.to_string(), factory);
    }

    pub fn register_action(&mut self, type_id: &str, factory: ActionFactory) {
        self.actions.insert(type_id.to_string(), factory);
    }

    /// Makes a long-lived connector instance available to every job under
    /// `id`. A connector declared in a job definition with the same id wins.
    pub fn share_connector(&mut self, id: impl Into<String>, connector: ConnectorInstance) {
        self.shared.insert(id.into(), connector);
    }

    /// Builds the file-level `[[connector]]` definitions once and shares them
    /// with every job built afterwards.
    pub fn share_definitions(&mut self, definitions: &[ConnectorDefinition]) -> Result<(), EngineError> {
        for entry in definitions {
            let instance = self.build_connector(entry)?;
            self.share_connector(entry.id.clone(), instance);
        }
        Ok(())
    }

    fn build_connector(&self, entry: &ConnectorDefinition) -> Result<ConnectorInstance, EngineError> {
        let factory = self.connectors.get(&entry.type_id).ok_or_else(|| {
            EngineError::Config(format!("unknown connector type '{}'", entry.type_id))
        })?;
        let owner = format!("connector '{}'", entry.id);
        factory(&entry.id, &Params::new(&owner, &entry.params))
    }

    /// Builds the connectors of `definition` on top of the shared ones.
    pub fn build_connectors(&self, definition: &JobDefinition) -> Result<Connectors, EngineError> {
        let mut connectors = Connectors {
            by_id: self.shared.clone(),
        };
        for entry in &definition.connectors {
            connectors.by_id.insert(entry.id.clone(), self.build_connector(entry)?);
        }
        Ok(connectors)
    }

    /// Materializes a fresh job instance from `definition`.
    pub fn build_job(&self, definition: &JobDefinition) -> Result<Job, EngineError> {
        let trigger_factory = self.triggers.get(&definition.trigger.type_id).ok_or_else(|| {
            EngineError::Config(format!("unknown trigger type '{}'", definition.trigger.type_id))
        })?;
        let connectors = self.build_connectors(definition)?;
        let owner = format!("trigger of job '{}'", definition.id);
        let trigger = trigger_factory(&Params::new(&owner, &definition.trigger.params), &connectors)?;

        let mut job = Job::new(&definition.id, &definition.name, trigger);
        job.active = definition.active;
        job.history_limit = definition.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        job.simulation_limit = definition.simulation_limit;

        for (index, task_def) in definition.tasks.iter().enumerate() {
            let task_id = task_def
                .id
                .clone()
                .unwrap_or_else(|| format!("{}-task-{}", definition.id, index + 1));
            let mut task = Task::new(task_id, &task_def.name);
            task.concurrency = task_def.concurrency.map(|limit| limit.max(1));

            for action_def in &task_def.actions {
                task.actions.push(self.build_action(action_def, &connectors)?);
            }
            job.tasks.push(task);
        }
        Ok(job)
    }

    fn build_action(
        &self,
        definition: &ActionDefinition,
        connectors: &Connectors,
    ) -> Result<Box<dyn Action>, EngineError> {
        let factory = self.actions.get(&definition.type_id).ok_or_else(|| {
            EngineError::Config(format!("unknown action type '{}'", definition.type_id))
        })?;
        let name = definition
            .name
            .clone()
            .unwrap_or_else(|| definition.type_id.clone());
        let mut meta = ActionMeta::new(&name);
        if let Some(id) = &definition.id {
            meta = meta.with_id(id);
        }
        meta.active = definition.active;
        meta.max_parallelism = definition.max_parallelism.map(|limit| limit.max(1));

        let owner = format!("action '{name}'");
        factory(meta, &Params::new(&owner, &definition.params), connectors)
    }

    /// Runs the connection test of every connector `definition` declares.
    /// Returns `(connector id, failure)` per connector.
    pub async fn test_connections(
        &self,
        definition: &JobDefinition,
    ) -> Result<Vec<(String, Option<String>)>, EngineError> {
        let connectors = self.build_connectors(definition)?;
        let mut results = Vec::with_capacity(definition.connectors.len());
        for entry in &definition.connectors {
            let failure = match connectors.by_id.get(&entry.id) {
                Some(instance) => instance
                    .as_connector()
                    .connection_test()
                    .await
                    .err()
                    .map(|err| err.to_string()),
                None => Some("not built".to_string()),
            };
            results.push((entry.id.clone(), failure));
        }
        Ok(results)
    }
}

fn manual_trigger(params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Trigger>, EngineError> {
    Ok(Box::new(ManualTrigger {
        data: params.object("data")?,
    }))
}

fn interval_trigger(params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Trigger>, EngineError> {
    let every = match (params.opt_u64("every_secs")?, params.opt_u64("every_millis")?) {
        (Some(secs), _) => Duration::from_secs(secs),
        (None, Some(millis)) => Duration::from_millis(millis),
        (None, None) => return Err(params.missing("every_secs")),
    };
    if every.is_zero() {
        return Err(params.invalid("every_secs", "greater than zero"));
    }
    let mut trigger = IntervalTrigger::new(every);
    trigger.data = params.object("data")?;
    Ok(Box::new(trigger))
}

fn cron_trigger(params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Trigger>, EngineError> {
    let mut trigger = CronTrigger::new(&params.str("expression")?)
        .map_err(|err| EngineError::Config(format!("{}: {err}", params.owner)))?;
    trigger.data = params.object("data")?;
    Ok(Box::new(trigger))
}

fn event_trigger(params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Trigger>, EngineError> {
    let mut trigger = EventTrigger::new(params.str("event_type")?);
    trigger.data = params.object("data")?;
    Ok(Box::new(trigger))
}

fn message_trigger(params: &Params<'_>, connectors: &Connectors) -> Result<Box<dyn Trigger>, EngineError> {
    let mut trigger = MessageTrigger::new(connectors.message(&params.str("connector")?)?);
    trigger.data = params.object("data")?;
    Ok(Box::new(trigger))
}

fn localfs_connector(id: &str, params: &Params<'_>) -> Result<ConnectorInstance, EngineError> {
    Ok(ConnectorInstance::File(Arc::new(LocalFsConnector::new(
        id,
        params.str("root")?,
    ))))
}

fn channel_connector(id: &str, params: &Params<'_>) -> Result<ConnectorInstance, EngineError> {
    let capacity = params.opt_u64("capacity")?.unwrap_or(64).max(1);
    Ok(ConnectorInstance::Message(Arc::new(ChannelMessageConnector::new(
        id,
        capacity as usize,
    ))))
}

fn skip_action(meta: ActionMeta, params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Action>, EngineError> {
    Ok(Box::new(SkipAction::new(meta, params.usize("number")?)))
}

fn limit_action(meta: ActionMeta, params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Action>, EngineError> {
    Ok(Box::new(LimitAction::new(meta, params.usize("number")?)))
}

fn duplicate_action(meta: ActionMeta, params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Action>, EngineError> {
    Ok(Box::new(DuplicateAction::new(meta, params.usize("amount")?)))
}

fn add_data_action(meta: ActionMeta, params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Action>, EngineError> {
    Ok(Box::new(AddDataAction::new(meta, params.object("values")?)))
}

fn filter_regex_action(
    meta: ActionMeta,
    params: &Params<'_>,
    _: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    let action = FilterByRegexAction::new(
        meta,
        params.str("input")?,
        &params.str("pattern")?,
        params.bool_or("invert", false)?,
    )
    .map_err(|err| EngineError::Config(format!("{}: {err}", params.owner)))?;
    Ok(Box::new(action))
}

fn filter_timestamp_action(
    meta: ActionMeta,
    params: &Params<'_>,
    _: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    let amount = params.opt_u64("amount")?.unwrap_or(1);
    let unit = params.opt_str("time_unit")?.unwrap_or_else(|| "days".into());
    let span = time_span(amount, &unit)
        .ok_or_else(|| params.invalid("time_unit", "seconds, minutes, hours, days or weeks"))?;
    let format = params.opt_str("timestamp_format")?.unwrap_or_else(|| "rfc3339".into());
    Ok(Box::new(FilterByTimestampAction::new(
        meta,
        params.str("input")?,
        span,
        params.bool_or("older_than", true)?,
        TimestampFormat::parse(&format),
    )))
}

fn split_array_action(meta: ActionMeta, params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Action>, EngineError> {
    let action = SplitArrayAction::new(meta, &params.str("array_selector")?)
        .map_err(|err| EngineError::Config(format!("{}: {err}", params.owner)))?;
    Ok(Box::new(action))
}

fn pause_action(meta: ActionMeta, params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Action>, EngineError> {
    let millis = params.opt_u64("millis")?.ok_or_else(|| params.missing("millis"))?;
    Ok(Box::new(PauseAction::new(meta, Duration::from_millis(millis))))
}

fn log_action(meta: ActionMeta, params: &Params<'_>, _: &Connectors) -> Result<Box<dyn Action>, EngineError> {
    let message = params.opt_str("message")?.unwrap_or_else(|| "{{data}}".into());
    Ok(Box::new(LogAction::new(meta, message)))
}

fn list_files_action(
    meta: ActionMeta,
    params: &Params<'_>,
    connectors: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    Ok(Box::new(ListFilesAction::new(
        meta,
        connectors.file(&params.str("connector")?)?,
        params.str("directory")?,
        params.opt_str("file_ending")?,
    )))
}

fn read_file_action(
    meta: ActionMeta,
    params: &Params<'_>,
    connectors: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    let mut action = ReadFileAction::new(meta, connectors.file(&params.str("connector")?)?);
    if let (Some(directory), Some(filename)) = (params.opt_str("directory")?, params.opt_str("filename")?) {
        action = action.with_location(directory, filename);
    }
    if let Some(key) = params.opt_str("target_key")? {
        action = action.with_target_key(key);
    }
    Ok(Box::new(action))
}

fn transfer_params(params: &Params<'_>) -> Result<TransferParams, EngineError> {
    let mut transfer = TransferParams::to_directory(params.str("target_directory")?);
    if let Some(directory) = params.opt_str("source_directory")? {
        transfer.source_directory = directory;
    }
    if let Some(filename) = params.opt_str("source_filename")? {
        transfer.source_filename = filename;
    }
    transfer.target_filename = params.opt_str("target_filename")?;
    Ok(transfer)
}

fn copy_file_action(
    meta: ActionMeta,
    params: &Params<'_>,
    connectors: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    let source = connectors.file(&params.str("source_connector")?)?;
    let target = match params.opt_str("target_connector")? {
        Some(id) => connectors.file(&id)?,
        None => Arc::clone(&source),
    };
    Ok(Box::new(CopyFileAction::new(meta, source, target, transfer_params(params)?)))
}

fn move_file_action(
    meta: ActionMeta,
    params: &Params<'_>,
    connectors: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    Ok(Box::new(MoveFileAction::new(
        meta,
        connectors.file(&params.str("connector")?)?,
        transfer_params(params)?,
    )))
}

fn delete_file_action(
    meta: ActionMeta,
    params: &Params<'_>,
    connectors: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    let mut action = DeleteFileAction::new(meta, connectors.file(&params.str("connector")?)?);
    if let (Some(directory), Some(filename)) = (params.opt_str("directory")?, params.opt_str("filename")?) {
        action = action.with_location(directory, filename);
    }
    Ok(Box::new(action))
}

fn write_lines_file_action(
    meta: ActionMeta,
    params: &Params<'_>,
    connectors: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    Ok(Box::new(WriteLinesFileAction::new(
        meta,
        connectors.file(&params.str("connector")?)?,
        params.str("file")?,
        params.str("line")?,
    )))
}

fn send_message_action(
    meta: ActionMeta,
    params: &Params<'_>,
    connectors: &Connectors,
) -> Result<Box<dyn Action>, EngineError> {
    let mut action = SendMessageAction::new(meta, connectors.message(&params.str("connector")?)?)
        .with_headers(params.object("headers")?);
    if let Some(content) = params.opt_str("content")? {
        action = action.with_content(content);
    }
    Ok(Box::new(action))
}
