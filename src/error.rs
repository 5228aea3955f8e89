use thiserror::Error;

/// Errors raised by the execution engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job '{0}' already has an active execution")]
    JobAlreadyRunning(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task '{task}' failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: ActionError,
    },

    #[error("Worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Execution of job '{0}' ended without reporting a result")]
    Dropped(String),

    /// Raised by [`ExecutionStore`](crate::store::ExecutionStore) backends.
    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures of a single action invocation or of a connector it calls.
#[derive(Debug, Error)]
pub enum ActionError {
    /// A parameter is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The data item lacks a value the action needs.
    #[error("missing value '{0}' in data item")]
    MissingValue(String),

    /// The remote side refused the operation.
    #[error("rejected by {connector}: {message}")]
    Rejected { connector: String, message: String },

    /// The operation was aborted because the execution was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    #[error("action panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ActionError {
    pub fn config(message: impl Into<String>) -> Self {
        ActionError::Config(message.into())
    }
}

/// Renders an error together with its source chain, e.g.
/// `Task 'import' failed: IO error: file not found`.
pub fn error_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut cause = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !cause.ends_with(&text) {
            cause.push_str(": ");
            cause.push_str(&text);
        }
        source = inner.source();
    }
    cause
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failed_display() {
        let err = EngineError::TaskFailed {
            task: "import".into(),
            source: ActionError::MissingValue("data.filename".into()),
        };
        assert_eq!(
            err.to_string(),
            "Task 'import' failed: missing value 'data.filename' in data item"
        );
    }

    #[test]
    fn error_cause_does_not_repeat_sources() {
        let err = EngineError::TaskFailed {
            task: "copy".into(),
            source: ActionError::Io(std::io::Error::other("disk full")),
        };
        assert_eq!(error_cause(&err), "Task 'copy' failed: IO error: disk full");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
        assert_send_sync::<ActionError>();
    }
}
