//! Actions working on files through a [`FileConnector`].
//!
//! Directory and filename parameters accept `{{path}}` placeholders and
//! default to the `data.directory` / `data.filename` fields written by
//! [`ListFilesAction`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::template;
use super::{Action, ActionMeta, ExecutionContext};
use crate::connector::FileConnector;
use crate::error::ActionError;
use crate::model::{DataItem, SIMULATION_LOG_KEY};
use crate::simulation::Sandbox;

pub const CATEGORY: &str = "file";

pub const FILENAME_KEY: &str = "filename";
pub const DIRECTORY_KEY: &str = "directory";
pub const LAST_MODIFIED_KEY: &str = "lastModified";
pub const WRITTEN_FILENAME_KEY: &str = "writtenFilename";

const DEFAULT_DIRECTORY: &str = "{{data.directory}}";
const DEFAULT_FILENAME: &str = "{{data.filename}}";

fn join_path(directory: &str, filename: &str) -> String {
    if directory.is_empty() {
        filename.to_string()
    } else if directory.ends_with('/') {
        format!("{directory}{filename}")
    } else {
        format!("{directory}/{filename}")
    }
}

/// Source and target locations of a transfer, resolved against one item.
struct Transfer {
    source_directory: String,
    source_filename: String,
    target_directory: String,
    target_filename: String,
}

impl Transfer {
    fn source(&self) -> String {
        join_path(&self.source_directory, &self.source_filename)
    }

    fn target(&self) -> String {
        join_path(&self.target_directory, &self.target_filename)
    }

    /// Points the item at the transferred file.
    fn apply(&self, item: &mut DataItem) {
        let data = item.data_mut();
        data.insert(DIRECTORY_KEY.into(), Value::String(self.target_directory.clone()));
        data.insert(FILENAME_KEY.into(), Value::String(self.target_filename.clone()));
    }
}

/// Parameters shared by [`CopyFileAction`] and [`MoveFileAction`].
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub source_directory: String,
    pub source_filename: String,
    pub target_directory: String,
    /// Defaults to the source filename.
    pub target_filename: Option<String>,
}

impl TransferParams {
    pub fn to_directory(target_directory: impl Into<String>) -> Self {
        Self {
            source_directory: DEFAULT_DIRECTORY.into(),
            source_filename: DEFAULT_FILENAME.into(),
            target_directory: target_directory.into(),
            target_filename: None,
        }
    }

    fn resolve(&self, item: &DataItem) -> Option<Transfer> {
        let source_filename = template::resolve(&self.source_filename, item)?;
        let target_filename = match &self.target_filename {
            Some(name) => template::resolve(name, item)?,
            None => source_filename.clone(),
        };
        Some(Transfer {
            source_directory: template::resolve(&self.source_directory, item)?,
            source_filename,
            target_directory: template::resolve(&self.target_directory, item)?,
            target_filename,
        })
    }
}

fn unresolved(mut item: DataItem, ctx: &ExecutionContext, what: &str) -> Vec<DataItem> {
    if ctx.simulation {
        item.insert(
            SIMULATION_LOG_KEY,
            Value::String(format!("Couldn't resolve variables for {what}.")),
        );
    }
    vec![item]
}

/// Emits one item per file found in a directory.
pub struct ListFilesAction {
    meta: ActionMeta,
    connector: Arc<dyn FileConnector>,
    directory: String,
    file_ending: Option<String>,
}

impl ListFilesAction {
    pub const TYPE_ID: &'static str = "list-files";

    pub fn new(
        meta: ActionMeta,
        connector: Arc<dyn FileConnector>,
        directory: impl Into<String>,
        file_ending: Option<String>,
    ) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            connector,
            directory: directory.into(),
            file_ending,
        }
    }
}

#[async_trait]
impl Action for ListFilesAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn max_parallelism(&self) -> Option<usize> {
        Some(1)
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let directory = template::resolve(&self.directory, &item)
            .ok_or_else(|| ActionError::MissingValue(self.directory.clone()))?;
        let files = self
            .connector
            .list_files(&directory, self.file_ending.as_deref())
            .await?;

        Ok(files
            .into_iter()
            .map(|file| {
                let mut out = item.clone();
                let data = out.data_mut();
                data.insert(FILENAME_KEY.into(), Value::String(file.filename));
                data.insert(DIRECTORY_KEY.into(), Value::String(directory.clone()));
                if let Some(modified) = file.last_modified {
                    data.insert(LAST_MODIFIED_KEY.into(), Value::String(modified.to_rfc3339()));
                }
                out
            })
            .collect())
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.connector = sandbox.file(&self.connector);
    }
}

/// Reads a file's content into the item.
pub struct ReadFileAction {
    meta: ActionMeta,
    connector: Arc<dyn FileConnector>,
    directory: String,
    filename: String,
    target_key: String,
}

impl ReadFileAction {
    pub const TYPE_ID: &'static str = "read-file";

    pub fn new(meta: ActionMeta, connector: Arc<dyn FileConnector>) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            connector,
            directory: DEFAULT_DIRECTORY.into(),
            filename: DEFAULT_FILENAME.into(),
            target_key: "content".into(),
        }
    }

    pub fn with_location(mut self, directory: impl Into<String>, filename: impl Into<String>) -> Self {
        self.directory = directory.into();
        self.filename = filename.into();
        self
    }

    pub fn with_target_key(mut self, key: impl Into<String>) -> Self {
        self.target_key = key.into();
        self
    }
}

#[async_trait]
impl Action for ReadFileAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        mut item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let (Some(directory), Some(filename)) = (
            template::resolve(&self.directory, &item),
            template::resolve(&self.filename, &item),
        ) else {
            return Ok(unresolved(item, ctx, "reading"));
        };
        let path = join_path(&directory, &filename);
        let wip = ctx.work_in_progress(format!("read {path}"));
        let content = self.connector.read(&path, &wip).await?;
        item.data_mut().insert(self.target_key.clone(), Value::String(content));
        Ok(vec![item])
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.connector = sandbox.file(&self.connector);
    }
}

/// Copies a file, possibly between two connectors.
pub struct CopyFileAction {
    meta: ActionMeta,
    source: Arc<dyn FileConnector>,
    target: Arc<dyn FileConnector>,
    params: TransferParams,
}

impl CopyFileAction {
    pub const TYPE_ID: &'static str = "copy-file";

    pub fn new(
        meta: ActionMeta,
        source: Arc<dyn FileConnector>,
        target: Arc<dyn FileConnector>,
        params: TransferParams,
    ) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            source,
            target,
            params,
        }
    }
}

#[async_trait]
impl Action for CopyFileAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        mut item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let Some(transfer) = self.params.resolve(&item) else {
            return Ok(unresolved(item, ctx, "copying"));
        };
        let (source, target) = (transfer.source(), transfer.target());
        let wip = ctx.work_in_progress(format!("copy {source}"));

        debug!("Copying file '{source}' to '{target}'");
        if Arc::ptr_eq(&self.source, &self.target) {
            self.source.copy(&source, &target, &wip).await?;
        } else {
            let content = self.source.read_bytes(&source, &wip).await?;
            self.target.write_bytes(&target, &content, &wip).await?;
        }

        transfer.apply(&mut item);
        Ok(vec![item])
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        let shared = Arc::ptr_eq(&self.source, &self.target);
        self.source = sandbox.file(&self.source);
        self.target = if shared {
            Arc::clone(&self.source)
        } else {
            sandbox.file(&self.target)
        };
    }
}

/// Moves a file within one connector.
pub struct MoveFileAction {
    meta: ActionMeta,
    connector: Arc<dyn FileConnector>,
    params: TransferParams,
}

impl MoveFileAction {
    pub const TYPE_ID: &'static str = "move-file";

    pub fn new(meta: ActionMeta, connector: Arc<dyn FileConnector>, params: TransferParams) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            connector,
            params,
        }
    }
}

#[async_trait]
impl Action for MoveFileAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        mut item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let Some(transfer) = self.params.resolve(&item) else {
            return Ok(unresolved(item, ctx, "moving"));
        };
        let (source, target) = (transfer.source(), transfer.target());
        let wip = ctx.work_in_progress(format!("move {source}"));

        debug!("Moving file '{source}' to '{target}'");
        self.connector.move_file(&source, &target, &wip).await?;

        transfer.apply(&mut item);
        Ok(vec![item])
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.connector = sandbox.file(&self.connector);
    }
}

/// Deletes the file the item points at.
pub struct DeleteFileAction {
    meta: ActionMeta,
    connector: Arc<dyn FileConnector>,
    directory: String,
    filename: String,
}

impl DeleteFileAction {
    pub const TYPE_ID: &'static str = "delete-file";

    pub fn new(meta: ActionMeta, connector: Arc<dyn FileConnector>) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            connector,
            directory: DEFAULT_DIRECTORY.into(),
            filename: DEFAULT_FILENAME.into(),
        }
    }

    pub fn with_location(mut self, directory: impl Into<String>, filename: impl Into<String>) -> Self {
        self.directory = directory.into();
        self.filename = filename.into();
        self
    }
}

#[async_trait]
impl Action for DeleteFileAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let (Some(directory), Some(filename)) = (
            template::resolve(&self.directory, &item),
            template::resolve(&self.filename, &item),
        ) else {
            return Ok(unresolved(item, ctx, "deleting"));
        };
        let path = join_path(&directory, &filename);
        let wip = ctx.work_in_progress(format!("delete {path}"));
        debug!("Deleting file '{path}'");
        self.connector.delete(&path, &wip).await?;
        Ok(vec![item])
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.connector = sandbox.file(&self.connector);
    }
}

/// Writes one line per item into a single file, created empty on setup.
/// The file is an exclusive resource, so items are written one at a time.
pub struct WriteLinesFileAction {
    meta: ActionMeta,
    connector: Arc<dyn FileConnector>,
    file: String,
    line: String,
}

impl WriteLinesFileAction {
    pub const TYPE_ID: &'static str = "write-lines-file";

    pub fn new(
        meta: ActionMeta,
        connector: Arc<dyn FileConnector>,
        file: impl Into<String>,
        line: impl Into<String>,
    ) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            connector,
            file: file.into(),
            line: line.into(),
        }
    }
}

#[async_trait]
impl Action for WriteLinesFileAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn max_parallelism(&self) -> Option<usize> {
        Some(1)
    }

    async fn setup(&self, ctx: &ExecutionContext) -> Result<(), ActionError> {
        let wip = ctx.work_in_progress(format!("create {}", self.file));
        debug!("Creating output file '{}'", self.file);
        self.connector.write(&self.file, "", &wip).await
    }

    async fn process(
        &self,
        mut item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let Some(line) = template::resolve(&self.line, &item) else {
            return Ok(unresolved(item, ctx, "writing a line"));
        };
        let wip = ctx.work_in_progress(format!("write {}", self.file));
        self.connector.append(&self.file, &format!("{line}\n"), &wip).await?;
        item.data_mut()
            .insert(WRITTEN_FILENAME_KEY.into(), Value::String(self.file.clone()));
        Ok(vec![item])
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.connector = sandbox.file(&self.connector);
    }
}
