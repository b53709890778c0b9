// src/store/mod.rs

//! Task and WorkflowRun persistence.
//!
//! The tracker reads and writes exclusively through [`TaskStore`]. Every
//! status change is a single atomic call so that concurrent writers (a poll
//! loop and a stop request, say) resolve to exactly one winner.

pub mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::types::{TaskId, TaskStatus, UserId, WorkflowStatus};

pub use memory::MemoryStore;

/// A registered unit of work whose execution runs an ordered DAG chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub dag_chain: Vec<String>,
    pub user_id: Option<UserId>,
    pub parameters: Value,
    /// Number of executions started so far. Runs are tagged with it.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`TaskStore::create_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub dag_chain: Vec<String>,
    pub user_id: Option<UserId>,
    pub parameters: Value,
}

/// One Airflow DAG run belonging to a task's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub task_id: TaskId,
    pub dag_id: String,
    pub chain_index: usize,
    pub attempt: u32,
    pub status: WorkflowStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub parameters: Value,
    pub note: Option<String>,
}

impl WorkflowRun {
    /// A freshly triggered run, queued in Airflow.
    pub fn queued(
        run_id: impl Into<String>,
        task_id: TaskId,
        dag_id: impl Into<String>,
        chain_index: usize,
        attempt: u32,
        parameters: Value,
        note: Option<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            task_id,
            dag_id: dag_id.into(),
            chain_index,
            attempt,
            status: WorkflowStatus::Queued,
            start_date: Some(Utc::now()),
            end_date: None,
            parameters,
            note,
        }
    }
}

/// Partial update applied to a non-terminal [`WorkflowRun`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<WorkflowStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl RunUpdate {
    pub fn status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Terminal update; stamps `end_date` with the current time.
    pub fn finished(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            end_date: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync + Debug {
    async fn create_task(&self, new: NewTask) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// All tasks, oldest first.
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Atomically move a task to `to`.
    ///
    /// Fails with `InvalidState` (leaving the task untouched) when the current
    /// status is not in `allowed_from` or the lifecycle forbids the move.
    /// Leaving `pending` increments the task's `attempt`.
    async fn transition_task(
        &self,
        id: TaskId,
        allowed_from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Task>;

    async fn insert_run(&self, run: WorkflowRun) -> Result<()>;

    /// Apply `update` to a run. Terminal runs are immutable.
    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<WorkflowRun>;

    /// Runs of a task ordered by attempt then chain index; `attempt` narrows
    /// to a single execution.
    async fn runs_for_task(&self, task_id: TaskId, attempt: Option<u32>)
    -> Result<Vec<WorkflowRun>>;
}
