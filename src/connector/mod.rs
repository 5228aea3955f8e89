//! Connectors: the external-effect capabilities actions call into.
//!
//! Every connector declares which of its operations are side-effect free
//! through [`Connector::safe_operations`]. During a simulation only those
//! operations reach the real implementation (see [`crate::simulation`]).

pub mod file;
pub mod message;

pub use file::{FileConnector, FileInfo, LocalFsConnector};
pub use message::{ChannelMessageConnector, Message, MessageConnector};

use async_trait::async_trait;

use crate::error::ActionError;

/// Base capability shared by every connector family.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;

    fn type_id(&self) -> &str;

    /// Names of the operations that may run during a simulation.
    fn safe_operations(&self) -> &'static [&'static str] {
        &[]
    }

    /// Checks that the connector can reach its backend. Has no side effects.
    async fn connection_test(&self) -> Result<(), ActionError> {
        Ok(())
    }
}
