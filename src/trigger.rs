//! Triggers decide when a job runs and contribute the payload of its first
//! data item.
//!
//! Event-driven triggers do not hold a reference back to their job: events
//! are pushed by the engine into a channel owned by the active run.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::connector::{Message, MessageConnector};
use crate::error::EngineError;
use crate::simulation::Sandbox;

/// Messages feeding an event-driven run, one event per message.
pub type EventSource = broadcast::Receiver<Message>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    /// Runs only when explicitly requested.
    Manual,
    /// Runs periodically through the [`Scheduler`](crate::engine::Scheduler).
    Interval(Duration),
    /// Runs at the times matched by a cron expression (with seconds field).
    Cron { expression: String },
    /// Stays active and processes every inbound event routed to the job.
    Event { event_type: String },
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Manual => write!(f, "manual"),
            TriggerKind::Interval(every) => write!(f, "every {}s", every.as_secs()),
            TriggerKind::Cron { expression } => write!(f, "cron ({expression})"),
            TriggerKind::Event { event_type } => write!(f, "event ({event_type})"),
        }
    }
}

pub trait Trigger: Send + Sync {
    fn kind(&self) -> TriggerKind;

    /// Payload placed in the `data` section of the first item.
    fn data(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Extra entries for the `meta` section of the first item.
    fn meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("trigger".into(), Value::String(self.kind().to_string()));
        meta
    }

    /// Inbound messages for an event-driven run. Triggers fed only through
    /// [`JobExecutor::on_inbound_event`](crate::engine::JobExecutor::on_inbound_event)
    /// return `None`.
    fn event_source(&self) -> Option<EventSource> {
        None
    }

    /// Replaces capabilities held by the trigger with simulation wrappers.
    fn sandbox(&mut self, _sandbox: &Sandbox) {}

    fn is_event_driven(&self) -> bool {
        matches!(self.kind(), TriggerKind::Event { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManualTrigger {
    pub data: Map<String, Value>,
}

impl ManualTrigger {
    pub const TYPE_ID: &'static str = "manual";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Trigger for ManualTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Manual
    }

    fn data(&self) -> Map<String, Value> {
        self.data.clone()
    }
}

#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    pub every: Duration,
    pub data: Map<String, Value>,
}

impl IntervalTrigger {
    pub const TYPE_ID: &'static str = "interval";

    pub fn new(every: Duration) -> Self {
        Self {
            every,
            data: Map::new(),
        }
    }
}

impl Trigger for IntervalTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Interval(self.every)
    }

    fn data(&self) -> Map<String, Value> {
        self.data.clone()
    }
}

/// Fires at the times of a cron schedule.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
    pub data: Map<String, Value>,
}

impl CronTrigger {
    pub const TYPE_ID: &'static str = "cron";

    /// Parses a cron expression with seconds, e.g. `0 */15 * * * *`.
    pub fn new(expression: &str) -> Result<Self, EngineError> {
        Ok(Self {
            expression: expression.to_string(),
            schedule: parse_schedule(expression)?,
            data: Map::new(),
        })
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

pub(crate) fn parse_schedule(expression: &str) -> Result<Schedule, EngineError> {
    Schedule::from_str(expression)
        .map_err(|err| EngineError::Config(format!("invalid cron expression '{expression}': {err}")))
}

impl Trigger for CronTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Cron {
            expression: self.expression.clone(),
        }
    }

    fn data(&self) -> Map<String, Value> {
        self.data.clone()
    }
}

/// Inbound message or webhook trigger. The event payload is merged over
/// the configured `data`.
#[derive(Debug, Clone)]
pub struct EventTrigger {
    pub event_type: String,
    pub data: Map<String, Value>,
}

impl EventTrigger {
    pub const TYPE_ID: &'static str = "event";

    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Map::new(),
        }
    }
}

impl Trigger for EventTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Event {
            event_type: self.event_type.clone(),
        }
    }

    fn data(&self) -> Map<String, Value> {
        self.data.clone()
    }
}

/// Runs the job once per message arriving at a message connector. The
/// message's `content` and `headers` are merged over the configured `data`.
pub struct MessageTrigger {
    connector: Arc<dyn MessageConnector>,
    pub data: Map<String, Value>,
}

impl MessageTrigger {
    pub const TYPE_ID: &'static str = "message";

    pub fn new(connector: Arc<dyn MessageConnector>) -> Self {
        Self {
            connector,
            data: Map::new(),
        }
    }
}

impl Trigger for MessageTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Event {
            event_type: format!("message:{}", self.connector.id()),
        }
    }

    fn data(&self) -> Map<String, Value> {
        self.data.clone()
    }

    fn event_source(&self) -> Option<EventSource> {
        self.connector.inbound()
    }

    fn sandbox(&mut self, sandbox: &Sandbox) {
        self.connector = sandbox.message(&self.connector);
    }
}
