// src/api/dto.rs

//! Request and response bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Task, WorkflowRun};
use crate::types::{TaskId, TaskStatus, UserId, WorkflowStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(default)]
    pub dag_chain: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Body of `POST /tasks/:id/execute` and `/retry`; may be omitted entirely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub total_dags: usize,
    pub workflow_runs: Vec<WorkflowRun>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub dag_chain: Vec<String>,
    pub workflow_runs: Vec<WorkflowRun>,
    pub total_workflow_runs: usize,
    pub overall_status: &'static str,
}

impl TaskStatusResponse {
    pub fn new(task: Task, workflow_runs: Vec<WorkflowRun>) -> Self {
        let overall_status = overall_status(&task, &workflow_runs);
        Self {
            task_id: task.id,
            name: task.name,
            status: task.status,
            attempt: task.attempt,
            dag_chain: task.dag_chain,
            total_workflow_runs: workflow_runs.len(),
            workflow_runs,
            overall_status,
        }
    }
}

/// Summary of the latest execution, derived from the task and its runs.
///
/// There is no partial-success value: a chain either completes every
/// element or fails.
pub fn overall_status(task: &Task, runs: &[WorkflowRun]) -> &'static str {
    if task.status == TaskStatus::Cancelled {
        return "cancelled";
    }
    if task.status == TaskStatus::Failed
        || runs.iter().any(|r| r.status == WorkflowStatus::Failed)
    {
        return "failed";
    }

    let succeeded = runs
        .iter()
        .filter(|r| r.status == WorkflowStatus::Success)
        .count();
    if !task.dag_chain.is_empty() && succeeded >= task.dag_chain.len() {
        return "completed";
    }
    if runs.is_empty() {
        return "pending";
    }
    "running"
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_chains: usize,
    pub websocket_connections: usize,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn task(status: TaskStatus, chain: usize) -> Task {
        Task {
            id: Uuid::nil(),
            name: "t".into(),
            status,
            dag_chain: (0..chain).map(|i| format!("dag_{i}")).collect(),
            user_id: None,
            parameters: json!({}),
            attempt: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn run(index: usize, status: WorkflowStatus) -> WorkflowRun {
        let mut run = WorkflowRun::queued(
            format!("r{index}"),
            Uuid::nil(),
            format!("dag_{index}"),
            index,
            1,
            json!({}),
            None,
        );
        run.status = status;
        run
    }

    #[test]
    fn overall_status_rules() {
        assert_eq!(overall_status(&task(TaskStatus::Pending, 2), &[]), "pending");
        assert_eq!(
            overall_status(
                &task(TaskStatus::Running, 2),
                &[run(0, WorkflowStatus::Success), run(1, WorkflowStatus::Running)]
            ),
            "running"
        );
        assert_eq!(
            overall_status(
                &task(TaskStatus::Completed, 2),
                &[run(0, WorkflowStatus::Success), run(1, WorkflowStatus::Success)]
            ),
            "completed"
        );
        assert_eq!(
            overall_status(
                &task(TaskStatus::Failed, 3),
                &[run(0, WorkflowStatus::Success), run(1, WorkflowStatus::Failed)]
            ),
            "failed"
        );
        assert_eq!(overall_status(&task(TaskStatus::Failed, 1), &[]), "failed");
        assert_eq!(
            overall_status(&task(TaskStatus::Cancelled, 2), &[run(0, WorkflowStatus::Failed)]),
            "cancelled"
        );
    }
}
