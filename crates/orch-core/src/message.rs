//! Message envelope for worker/coordinator communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::task::StatusUpdate;

/// Message destination: one named worker or every subscriber
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Destination {
    Agent(String),
    Broadcast,
}

impl Destination {
    pub fn agent(name: impl Into<String>) -> Self {
        Destination::Agent(name.into())
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Agent(name) => write!(f, "{}", name),
            Destination::Broadcast => write!(f, "*"),
        }
    }
}

/// Closed set of message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    TaskComplete,
    TaskFailed,
    Request,
    Response,
    StatusUpdate,
}

/// Delivery priority; lower value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(3);
    pub const NORMAL: Priority = Priority(5);
    pub const LOW: Priority = Priority(8);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub from_agent: String,
    pub to_agent: Destination,
    pub message_type: MessageType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Ties a response back to its originating request
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl Message {
    pub fn new(
        from: &str,
        to: Destination,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            from_agent: from.to_string(),
            to_agent: to,
            message_type,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            priority: Priority::default(),
        }
    }

    pub fn broadcast(from: &str, message_type: MessageType, payload: Value) -> Self {
        Self::new(from, Destination::Broadcast, message_type, payload)
    }

    /// Worker finished; carries the originating task id.
    pub fn task_complete(from: &str, to: &str, task_id: &str, result: Value) -> Self {
        Self::new(
            from,
            Destination::agent(to),
            MessageType::TaskComplete,
            json!({ "task_id": task_id, "result": result }),
        )
    }

    /// Worker raised or missed its deadline; carries the originating task id.
    pub fn task_failed(from: &str, to: &str, task_id: &str, error: &str, timed_out: bool) -> Self {
        Self::new(
            from,
            Destination::agent(to),
            MessageType::TaskFailed,
            json!({ "task_id": task_id, "error": error, "timed_out": timed_out }),
        )
    }

    pub fn status(from: &str, to: Destination, payload: Value) -> Self {
        Self::new(from, to, MessageType::StatusUpdate, payload)
    }

    /// Request with a fresh correlation id
    pub fn request(from: &str, to: &str, payload: Value) -> Self {
        let mut message = Self::new(from, Destination::agent(to), MessageType::Request, payload);
        message.correlation_id = Some(uuid::Uuid::new_v4().to_string());
        message
    }

    /// Response to `request`, addressed to its sender
    pub fn reply_to(request: &Message, from: &str, payload: Value) -> Self {
        let mut message = Self::new(
            from,
            Destination::agent(request.from_agent.clone()),
            MessageType::Response,
            payload,
        );
        message.correlation_id = request
            .correlation_id
            .clone()
            .or_else(|| Some(request.message_id.clone()));
        message
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Task id carried in the payload, if any
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("task_id").and_then(Value::as_str)
    }

    /// Decode a task-complete / task-failed message into the registry update it requests.
    pub fn as_task_update(&self) -> Option<(String, StatusUpdate)> {
        let task_id = self.task_id()?.to_string();
        let update = match self.message_type {
            MessageType::TaskComplete => StatusUpdate::Completed(
                self.payload.get("result").cloned().unwrap_or(Value::Null),
            ),
            MessageType::TaskFailed => {
                let error = self
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                let timed_out = self
                    .payload
                    .get("timed_out")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if timed_out {
                    StatusUpdate::TimedOut(error)
                } else {
                    StatusUpdate::Failed(error)
                }
            }
            _ => return None,
        };
        Some((task_id, update))
    }
}
