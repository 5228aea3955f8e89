//! Decorators that gate connector calls during a simulation.
//!
//! A wrapper forwards an operation to the real connector only when the
//! connector lists it in [`Connector::safe_operations`]. Any other call is
//! suppressed: the wrapper answers with a benign default (empty listing,
//! empty content, `Ok(())`) and records the call in the [`Sandbox`] log.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::connector::file::ops as file_ops;
use crate::connector::message::ops as message_ops;
use crate::connector::{Connector, FileConnector, FileInfo, Message, MessageConnector};
use crate::error::ActionError;
use crate::model::WorkInProgressMonitor;

/// A connector call that was suppressed during a simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterceptedCall {
    pub connector: String,
    pub operation: String,
    pub detail: String,
}

/// Hands out simulation wrappers and collects the calls they suppress.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    intercepted: Arc<Mutex<Vec<InterceptedCall>>>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, inner: &Arc<dyn FileConnector>) -> Arc<dyn FileConnector> {
        Arc::new(SimulatedFileConnector {
            gate: Gate::new(inner.as_ref(), self.clone()),
            inner: Arc::clone(inner),
        })
    }

    pub fn message(&self, inner: &Arc<dyn MessageConnector>) -> Arc<dyn MessageConnector> {
        Arc::new(SimulatedMessageConnector {
            gate: Gate::new(inner.as_ref(), self.clone()),
            inner: Arc::clone(inner),
        })
    }

    pub fn intercepted(&self) -> Vec<InterceptedCall> {
        self.intercepted.lock().clone()
    }

    fn record(&self, call: InterceptedCall) {
        debug!(
            connector = %call.connector,
            operation = %call.operation,
            "simulation intercepted call: {}",
            call.detail
        );
        self.intercepted.lock().push(call);
    }
}

/// The allowlist check shared by all wrappers.
struct Gate {
    connector_id: String,
    allowed: HashSet<&'static str>,
    sandbox: Sandbox,
}

impl Gate {
    fn new<C: Connector + ?Sized>(connector: &C, sandbox: Sandbox) -> Self {
        Self {
            connector_id: connector.id().to_string(),
            allowed: connector.safe_operations().iter().copied().collect(),
            sandbox,
        }
    }

    fn permits(&self, operation: &str, detail: impl FnOnce() -> String) -> bool {
        if self.allowed.contains(operation) {
            return true;
        }
        self.sandbox.record(InterceptedCall {
            connector: self.connector_id.clone(),
            operation: operation.to_string(),
            detail: detail(),
        });
        false
    }
}

struct SimulatedFileConnector {
    inner: Arc<dyn FileConnector>,
    gate: Gate,
}

#[async_trait]
impl Connector for SimulatedFileConnector {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn type_id(&self) -> &str {
        self.inner.type_id()
    }

    fn safe_operations(&self) -> &'static [&'static str] {
        self.inner.safe_operations()
    }

    async fn connection_test(&self) -> Result<(), ActionError> {
        self.inner.connection_test().await
    }
}

#[async_trait]
impl FileConnector for SimulatedFileConnector {
    async fn list_files(
        &self,
        directory: &str,
        file_ending: Option<&str>,
    ) -> Result<Vec<FileInfo>, ActionError> {
        if self.gate.permits(file_ops::LIST_FILES, || directory.to_string()) {
            self.inner.list_files(directory, file_ending).await
        } else {
            Ok(Vec::new())
        }
    }

    async fn read(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<String, ActionError> {
        if self.gate.permits(file_ops::READ, || file.to_string()) {
            self.inner.read(file, wip).await
        } else {
            Ok(String::new())
        }
    }

    async fn read_bytes(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<Vec<u8>, ActionError> {
        if self.gate.permits(file_ops::READ_BYTES, || file.to_string()) {
            self.inner.read_bytes(file, wip).await
        } else {
            Ok(Vec::new())
        }
    }

    async fn write(
        &self,
        file: &str,
        content: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        if self.gate.permits(file_ops::WRITE, || file.to_string()) {
            self.inner.write(file, content, wip).await
        } else {
            Ok(())
        }
    }

    async fn write_bytes(
        &self,
        file: &str,
        content: &[u8],
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        if self.gate.permits(file_ops::WRITE_BYTES, || format!("{file} ({} bytes)", content.len())) {
            self.inner.write_bytes(file, content, wip).await
        } else {
            Ok(())
        }
    }

    async fn append(
        &self,
        file: &str,
        content: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        if self.gate.permits(file_ops::APPEND, || file.to_string()) {
            self.inner.append(file, content, wip).await
        } else {
            Ok(())
        }
    }

    async fn copy(
        &self,
        source: &str,
        target: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        if self.gate.permits(file_ops::COPY, || format!("{source} -> {target}")) {
            self.inner.copy(source, target, wip).await
        } else {
            Ok(())
        }
    }

    async fn move_file(
        &self,
        source: &str,
        target: &str,
        wip: &WorkInProgressMonitor,
    ) -> Result<(), ActionError> {
        if self.gate.permits(file_ops::MOVE, || format!("{source} -> {target}")) {
            self.inner.move_file(source, target, wip).await
        } else {
            Ok(())
        }
    }

    async fn delete(&self, file: &str, wip: &WorkInProgressMonitor) -> Result<(), ActionError> {
        if self.gate.permits(file_ops::DELETE, || file.to_string()) {
            self.inner.delete(file, wip).await
        } else {
            Ok(())
        }
    }
}

struct SimulatedMessageConnector {
    inner: Arc<dyn MessageConnector>,
    gate: Gate,
}

#[async_trait]
impl Connector for SimulatedMessageConnector {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn type_id(&self) -> &str {
        self.inner.type_id()
    }

    fn safe_operations(&self) -> &'static [&'static str] {
        self.inner.safe_operations()
    }

    async fn connection_test(&self) -> Result<(), ActionError> {
        self.inner.connection_test().await
    }
}

#[async_trait]
impl MessageConnector for SimulatedMessageConnector {
    async fn send(&self, message: Message) -> Result<(), ActionError> {
        if self.gate.permits(message_ops::SEND, || message.content.clone()) {
            self.inner.send(message).await
        } else {
            Ok(())
        }
    }

    // Receiving has no side effects.
    fn inbound(&self) -> Option<tokio::sync::broadcast::Receiver<Message>> {
        self.inner.inbound()
    }
}
