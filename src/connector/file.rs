use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::Connector;
use crate::error::ActionError;
use crate::model::WorkInProgressMonitor;

/// Operation names of the file connector family.
pub mod ops {
    pub const LIST_FILES: &str = "list_files";
    pub const READ: &str = "read";
    pub const READ_BYTES: &str = "read_bytes";
    pub const WRITE: &str = "write";
    pub const WRITE_BYTES: &str = "write_bytes";
    pub const APPEND: &str = "append";
    pub const COPY: &str = "copy";
    pub const MOVE: &str = "move";
    pub const DELETE: &str = "delete";
}

/// A file as reported by [`FileConnector::list_files`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub filename: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// File transfer capability.
#[async_trait]
pub trait FileConnector: Connector {
    /// Lists the files in `directory`, optionally only those ending in `file_ending`.
    async fn list_files(
        &self,
        directory: &str,
        file_ending: Option<&str>,
    ) -> Result<Vec<FileInfo>, ActionError>;

    /// Reads a text file.
    async fn read(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<String, ActionError>;

    async fn read_bytes(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<Vec<u8>, ActionError>;

    /// Creates or truncates `file` with `content`.
    async fn write(
        &self,
        file: &str,
        content: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError>;

    async fn write_bytes(
        &self,
        file: &str,
        content: &[u8],
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError>;

    /// Appends `content` to `file`, creating it if needed.
    async fn append(
        &self,
        file: &str,
        content: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError>;

    async fn copy(
        &self,
        source: &str,
        target: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError>;

    async fn move_file(
        &self,
        source: &str,
        target: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError>;

    async fn delete(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<(), ActionError>;
}

/// Connector for the local filesystem. Relative paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct LocalFsConnector {
    id: String,
    root: PathBuf,
}

impl LocalFsConnector {
    pub const TYPE_ID: &'static str = "localfs";

    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn ensure_parent(path: &Path) -> Result<(), ActionError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn check_cancelled(wip: &WorkInProgressMonitor) -> Result<(), ActionError> {
    if wip.is_cancelled() {
        Err(ActionError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl Connector for LocalFsConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_id(&self) -> &str {
        Self::TYPE_ID
    }

    fn safe_operations(&self) -> &'static [&'static str] {
        &[ops::LIST_FILES, ops::READ, ops::READ_BYTES]
    }

    async fn connection_test(&self) -> Result<(), ActionError> {
        let metadata = tokio::fs::metadata(&self.root).await?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(ActionError::config(format!(
                "root {} is not a directory",
                self.root.display()
            )))
        }
    }
}

#[async_trait]
impl FileConnector for LocalFsConnector {
    async fn list_files(
        &self,
        directory: &str,
        file_ending: Option<&str>,
    ) -> Result<Vec<FileInfo>, ActionError> {
        let mut entries = tokio::fs::read_dir(self.resolve(directory)).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            if let Some(ending) = file_ending {
                if !ending.is_empty() && !filename.ends_with(ending) {
                    continue;
                }
            }
            files.push(FileInfo {
                filename,
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }

    async fn read(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<String, ActionError> {
        check_cancelled(wip)?;
        let content = tokio::fs::read_to_string(self.resolve(file)).await?;
        wip.set_progress(100.0);
        Ok(content)
    }

    async fn read_bytes(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<Vec<u8>, ActionError> {
        check_cancelled(wip)?;
        let content = tokio::fs::read(self.resolve(file)).await?;
        wip.set_progress(100.0);
        Ok(content)
    }

    async fn write(
        &self,
        file: &str,
        content: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        self.write_bytes(file, content.as_bytes(), wip).await
    }

    async fn write_bytes(
        &self,
        file: &str,
        content: &[u8],
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        check_cancelled(wip)?;
        let path = self.resolve(file);
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, content).await?;
        wip.set_progress(100.0);
        Ok(())
    }

    async fn append(
        &self,
        file: &str,
        content: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        check_cancelled(wip)?;
        let path = self.resolve(file);
        Self::ensure_parent(&path).await?;
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        out.write_all(content.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }

    async fn copy(
        &self,
        source: &str,
        target: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        check_cancelled(wip)?;
        let target = self.resolve(target);
        Self::ensure_parent(&target).await?;
        tokio::fs::copy(self.resolve(source), &target).await?;
        wip.set_progress(100.0);
        Ok(())
    }

    async fn move_file(
        &self,
        source: &str,
        target: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        check_cancelled(wip)?;
        let source = self.resolve(source);
        let target = self.resolve(target);
        Self::ensure_parent(&target).await?;
        if let Err(e) = tokio::fs::rename(&source, &target).await {
            // Rename fails across filesystems; fall back to copy and delete.
            debug!("rename of {} failed ({e}), copying instead", source.display());
            tokio::fs::copy(&source, &target).await?;
            wip.set_progress(50.0);
            check_cancelled(wip)?;
            tokio::fs::remove_file(&source).await?;
        }
        wip.set_progress(100.0);
        Ok(())
    }

    async fn delete(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<(), ActionError> {
        check_cancelled(wip)?;
        tokio::fs::remove_file(self.resolve(file)).await?;
        wip.set_progress(100.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(dir: &tempfile::TempDir) -> LocalFsConnector {
        LocalFsConnector::new("local", dir.path())
    }

    #[tokio::test]
    async fn connection_test_requires_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(connector(&dir).connection_test().await.is_ok());

        let missing = LocalFsConnector::new("gone", dir.path().join("missing"));
        assert!(matches!(missing.connection_test().await, Err(ActionError::Io(_))));
    }

    #[tokio::test]
    async fn lists_only_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csv"), "b").unwrap();
        std::fs::write(dir.path().join("a.csv"), "a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "n").unwrap();
        std::fs::create_dir(dir.path().join("sub.csv")).unwrap();

        let files = connector(&dir).list_files(".", Some(".csv")).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
        assert!(files[0].last_modified.is_some());
    }

    #[tokio::test]
    async fn write_read_move_delete() {
        let dir = tempfile::tempdir().unwrap();
        let fs = connector(&dir);
        let wip = WorkInProgressMonitor::detached("test");

        fs.write("in/a.txt", "hello", &wip).await.unwrap();
        assert_eq!(fs.read("in/a.txt", &wip).await.unwrap(), "hello");

        fs.move_file("in/a.txt", "out/a.txt", &wip).await.unwrap();
        assert!(!dir.path().join("in/a.txt").exists());
        assert!(dir.path().join("out/a.txt").exists());

        fs.copy("out/a.txt", "copy/a.txt", &wip).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("copy/a.txt")).unwrap(), "hello");

        fs.delete("out/a.txt", &wip).await.unwrap();
        assert!(!dir.path().join("out/a.txt").exists());
    }

    #[tokio::test]
    async fn bytes_round_trip_without_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let fs = connector(&dir);
        let wip = WorkInProgressMonitor::detached("test");
        let payload = [0xff, 0xfe, 0x00, 0x89];

        fs.write_bytes("bin/blob", &payload, &wip).await.unwrap();
        assert_eq!(fs.read_bytes("bin/blob", &wip).await.unwrap(), payload);
        assert!(matches!(fs.read("bin/blob", &wip).await, Err(ActionError::Io(_))));
    }

    #[tokio::test]
    async fn append_creates_then_extends() {
        let dir = tempfile::tempdir().unwrap();
        let fs = connector(&dir);
        let wip = WorkInProgressMonitor::detached("test");

        fs.append("out/lines.txt", "one\n", &wip).await.unwrap();
        fs.append("out/lines.txt", "two\n", &wip).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/lines.txt")).unwrap(),
            "one\ntwo\n"
        );
    }

    #[tokio::test]
    async fn cancelled_monitor_aborts_before_touching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let wip = WorkInProgressMonitor::detached("test");
        wip.cancel();

        let result = connector(&dir).delete("a.txt", &wip).await;
        assert!(matches!(result, Err(ActionError::Cancelled)));
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn declares_read_operations_safe() {
        let fs = LocalFsConnector::new("local", "/tmp");
        assert_eq!(fs.safe_operations(), &[ops::LIST_FILES, ops::READ, ops::READ_BYTES]);
    }
}
