// src/events/mod.rs

//! Structured state-transition events and their routing topics.

pub mod bus;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{TaskId, UserId};

pub use bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "workflow.triggered")]
    WorkflowTriggered,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.stopped")]
    WorkflowStopped,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowTriggered => "workflow.triggered",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowFailed => "workflow.failed",
            EventKind::WorkflowStopped => "workflow.stopped",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskCancelled => "task.cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broadcast event, serialized verbatim to WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// DAG id of the chain element concerned.
    pub workflow_id: Option<String>,
    pub run_id: Option<String>,
    pub task_id: Option<TaskId>,
    pub user_id: Option<UserId>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, status: impl Into<String>) -> Self {
        Self {
            kind,
            workflow_id: None,
            run_id: None,
            task_id: None,
            user_id: None,
            status: status.into(),
            timestamp: Utc::now(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn workflow(mut self, dag_id: impl Into<String>) -> Self {
        self.workflow_id = Some(dag_id.into());
        self
    }

    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Whether a subscriber of `topic` should receive this event.
    pub fn matches(&self, topic: &Topic) -> bool {
        match topic {
            Topic::Global => true,
            Topic::User { user_id } => self.user_id == Some(*user_id),
            Topic::Workflow { workflow_id } => {
                self.workflow_id.as_deref() == Some(workflow_id.as_str())
            }
            Topic::UserWorkflow {
                user_id,
                workflow_id,
            } => {
                self.user_id == Some(*user_id)
                    && self.workflow_id.as_deref() == Some(workflow_id.as_str())
            }
        }
    }
}

/// Routing key a WebSocket connection subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Topic {
    Global,
    User { user_id: UserId },
    Workflow { workflow_id: String },
    UserWorkflow { user_id: UserId, workflow_id: String },
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Global => f.write_str("global"),
            Topic::User { user_id } => write!(f, "user:{user_id}"),
            Topic::Workflow { workflow_id } => write!(f, "workflow:{workflow_id}"),
            Topic::UserWorkflow {
                user_id,
                workflow_id,
            } => write!(f, "user:{user_id}:workflow:{workflow_id}"),
        }
    }
}
