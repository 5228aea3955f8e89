use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use super::Connector;
use crate::error::ActionError;

pub mod ops {
    pub const SEND: &str = "send";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
}

impl Message {
    /// The message as an event payload: `content` plus `headers`.
    pub fn into_payload(self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("content".into(), Value::String(self.content));
        payload.insert("headers".into(), Value::Object(self.headers));
        payload
    }
}

/// Messaging capability.
#[async_trait]
pub trait MessageConnector: Connector {
    async fn send(&self, message: Message) -> Result<(), ActionError>;

    /// Subscription to messages arriving at this connector, if it receives any.
    fn inbound(&self) -> Option<broadcast::Receiver<Message>> {
        None
    }
}

/// In-process broker: every sent message is broadcast to current subscribers.
#[derive(Debug, Clone)]
pub struct ChannelMessageConnector {
    id: String,
    sender: broadcast::Sender<Message>,
}

impl ChannelMessageConnector {
    pub const TYPE_ID: &'static str = "channel";

    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            id: id.into(),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }
}

impl Connector for ChannelMessageConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_id(&self) -> &str {
        Self::TYPE_ID
    }
}

#[async_trait]
impl MessageConnector for ChannelMessageConnector {
    async fn send(&self, message: Message) -> Result<(), ActionError> {
        if self.sender.send(message).is_err() {
            debug!(connector = %self.id, "message dropped, no subscribers");
        }
        Ok(())
    }

    fn inbound(&self) -> Option<broadcast::Receiver<Message>> {
        Some(self.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_sent_messages() {
        let connector = ChannelMessageConnector::new("bus", 8);
        let mut rx = connector.subscribe();
        let message = Message {
            content: "hello".into(),
            headers: Map::new(),
        };
        connector.send(message.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_not_an_error() {
        let connector = ChannelMessageConnector::new("bus", 8);
        let message = Message {
            content: "lost".into(),
            headers: Map::new(),
        };
        assert!(connector.send(message).await.is_ok());
        assert!(connector.safe_operations().is_empty());
    }
}
