// src/store/memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{NewTask, RunUpdate, Task, TaskStore, WorkflowRun};
use crate::errors::{ChainwatchError, Result};
use crate::types::{TaskId, TaskStatus};

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    runs: Vec<WorkflowRun>,
}

/// In-process [`TaskStore`]. One lock guards both tables, so a transition
/// and the checks preceding it form one critical section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.name.trim().is_empty() {
            return Err(ChainwatchError::Validation("task name must not be empty".into()));
        }
        if new.dag_chain.is_empty() {
            return Err(ChainwatchError::Validation("dag_chain must not be empty".into()));
        }
        if let Some(idx) = new.dag_chain.iter().position(|d| d.trim().is_empty()) {
            return Err(ChainwatchError::Validation(format!(
                "dag_chain[{idx}] must not be empty"
            )));
        }
        if !new.parameters.is_object() {
            return Err(ChainwatchError::Validation("parameters must be a JSON object".into()));
        }

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            name: new.name,
            status: TaskStatus::Pending,
            dag_chain: new.dag_chain,
            user_id: new.user_id,
            parameters: new.parameters,
            attempt: 0,
            created_at: now,
            updated_at: now,
        };

        self.tables.write().await.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.tables
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(ChainwatchError::TaskNotFound(id))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        id: TaskId,
        allowed_from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Task> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or(ChainwatchError::TaskNotFound(id))?;

        let from = task.status;
        if !allowed_from.contains(&from) || !from.can_transition_to(to) {
            return Err(ChainwatchError::InvalidState(format!(
                "task {id} is {from}; cannot move to {to}"
            )));
        }

        if from == TaskStatus::Pending {
            task.attempt += 1;
        }
        task.status = to;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn insert_run(&self, run: WorkflowRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.tasks.contains_key(&run.task_id) {
            return Err(ChainwatchError::TaskNotFound(run.task_id));
        }
        if tables.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(ChainwatchError::InvalidState(format!(
                "workflow run {} already recorded",
                run.run_id
            )));
        }
        tables.runs.push(run);
        Ok(())
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<WorkflowRun> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| ChainwatchError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            return Err(ChainwatchError::InvalidState(format!(
                "workflow run {run_id} is already {}",
                run.status
            )));
        }

        if let Some(status) = update.status {
            run.status = status;
        }
        if let Some(start) = update.start_date {
            run.start_date = Some(start);
        }
        if let Some(end) = update.end_date {
            run.end_date = Some(end);
        }
        if let Some(note) = update.note {
            run.note = Some(note);
        }
        Ok(run.clone())
    }

    async fn runs_for_task(
        &self,
        task_id: TaskId,
        attempt: Option<u32>,
    ) -> Result<Vec<WorkflowRun>> {
        let tables = self.tables.read().await;
        if !tables.tasks.contains_key(&task_id) {
            return Err(ChainwatchError::TaskNotFound(task_id));
        }
        let mut runs: Vec<WorkflowRun> = tables
            .runs
            .iter()
            .filter(|r| r.task_id == task_id && attempt.is_none_or(|a| r.attempt == a))
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.attempt, r.chain_index));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::WorkflowStatus;

    fn new_task(chain: &[&str]) -> NewTask {
        NewTask {
            name: "nightly".to_string(),
            dag_chain: chain.iter().map(|s| s.to_string()).collect(),
            user_id: Some(7),
            parameters: json!({}),
        }
    }

    #[tokio::test]
    async fn rejects_empty_chain() {
        let store = MemoryStore::new();
        let err = store.create_task(new_task(&[])).await.unwrap_err();
        assert!(matches!(err, ChainwatchError::Validation(_)));
    }

    #[tokio::test]
    async fn transition_checks_current_status() {
        let store = MemoryStore::new();
        let task = store.create_task(new_task(&["a"])).await.unwrap();

        let running = store
            .transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap();
        assert_eq!(running.attempt, 1);

        let err = store
            .transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainwatchError::InvalidState(_)));

        // allowed_from does not bypass the lifecycle
        let err = store
            .transition_task(task.id, &[TaskStatus::Running], TaskStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainwatchError::InvalidState(_)));
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn terminal_runs_are_immutable() {
        let store = MemoryStore::new();
        let task = store.create_task(new_task(&["a"])).await.unwrap();
        store
            .insert_run(WorkflowRun::queued("r1", task.id, "a", 0, 1, json!({}), None))
            .await
            .unwrap();

        store
            .update_run("r1", RunUpdate::finished(WorkflowStatus::Success))
            .await
            .unwrap();
        let err = store
            .update_run("r1", RunUpdate::status(WorkflowStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainwatchError::InvalidState(_)));

        let runs = store.runs_for_task(task.id, None).await.unwrap();
        assert_eq!(runs[0].status, WorkflowStatus::Success);
        assert!(runs[0].end_date.is_some());
    }

    #[tokio::test]
    async fn runs_are_filtered_by_attempt() {
        let store = MemoryStore::new();
        let task = store.create_task(new_task(&["a", "b"])).await.unwrap();
        for (run, attempt, idx) in [("r1", 1, 0), ("r2", 1, 1), ("r3", 2, 0)] {
            store
                .insert_run(WorkflowRun::queued(run, task.id, "a", idx, attempt, json!({}), None))
                .await
                .unwrap();
        }

        assert_eq!(store.runs_for_task(task.id, None).await.unwrap().len(), 3);
        let second = store.runs_for_task(task.id, Some(2)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].run_id, "r3");
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get_task(id).await,
            Err(ChainwatchError::TaskNotFound(_))
        ));
    }
}
