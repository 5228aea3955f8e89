use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::template;
use super::{Action, ActionMeta, ExecutionContext};
use crate::connector::{Message, MessageConnector};
use crate::error::ActionError;
use crate::model::DataItem;
use crate::simulation::Sandbox;

pub const CATEGORY: &str = "message";

/// Sends one message per item. The content template defaults to the whole
/// `data` section rendered as JSON.
pub struct SendMessageAction {
    meta: ActionMeta,
    connector: Arc<dyn MessageConnector>,
    content: String,
    headers: Map<String, Value>,
}

impl SendMessageAction {
    pub const TYPE_ID: &'static str = "send-message";

    pub fn new(meta: ActionMeta, connector: Arc<dyn MessageConnector>) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            connector,
            content: "{{data}}".into(),
            headers: Map::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_headers(mut self, headers: Map<String, Value>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl Action for SendMessageAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let content = template::resolve(&self.content, &item)
            .ok_or_else(|| ActionError::MissingValue(self.content.clone()))?;
        self.connector
            .send(Message {
                content,
                headers: self.headers.clone(),
            })
            .await?;
        Ok(vec![item])
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.connector = sandbox.message(&self.connector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::testing::context;
    use crate::connector::ChannelMessageConnector;
    use serde_json::json;

    #[tokio::test]
    async fn sends_resolved_content() {
        let bus = Arc::new(ChannelMessageConnector::new("bus", 4));
        let mut rx = bus.subscribe();
        let action = SendMessageAction::new(ActionMeta::new("notify"), bus.clone())
            .with_content("processed {{data.filename}}");

        let item: DataItem = serde_json::from_value(json!({"data": {"filename": "a.txt"}})).unwrap();
        let out = action.process(item.clone(), &context()).await.unwrap();

        assert_eq!(out, vec![item]);
        assert_eq!(rx.recv().await.unwrap().content, "processed a.txt");
    }

    #[tokio::test]
    async fn default_content_is_data_json() {
        let bus = Arc::new(ChannelMessageConnector::new("bus", 4));
        let mut rx = bus.subscribe();
        let action = SendMessageAction::new(ActionMeta::new("notify"), bus.clone());
        let item: DataItem = serde_json::from_value(json!({"data": {"n": 1}})).unwrap();
        action.process(item, &context()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn unresolved_content_fails() {
        let bus = Arc::new(ChannelMessageConnector::new("bus", 4));
        let action = SendMessageAction::new(ActionMeta::new("notify"), bus).with_content("{{data.x}}");
        let result = action.process(DataItem::new(), &context()).await;
        assert!(matches!(result, Err(ActionError::MissingValue(_))));
    }
}
