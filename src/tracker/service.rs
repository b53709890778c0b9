// src/tracker/service.rs

//! Start/stop/retry of task executions and the registry of live poll loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TrackerOptions;
use crate::errors::{ChainwatchError, Result};
use crate::events::{Event, EventKind};
use crate::store::{RunUpdate, Task, WorkflowRun};
use crate::tracker::TrackerContext;
use crate::tracker::chain::{ChainState, element_note, element_parameters};
use crate::tracker::poller::{ActiveMap, ChainPoller};
use crate::types::{TaskId, TaskStatus, WorkflowStatus};

/// Handle for a live chain.
///
/// - `cancel` stops the poll loop.
/// - `handle` is `None` while `start` is still triggering the first DAG.
pub(crate) struct ActiveChain {
    pub(crate) generation: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Per-execution overrides supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Merged over the task's own parameters.
    pub parameters: Option<Value>,
    /// Note recorded on the first WorkflowRun instead of the default one.
    pub note: Option<String>,
}

/// Result of a successful `start`.
#[derive(Debug, Clone)]
pub struct Execution {
    pub task: Task,
    pub runs: Vec<WorkflowRun>,
}

/// Owns every in-flight chain. At most one chain per task.
pub struct Tracker {
    ctx: TrackerContext,
    options: TrackerOptions,
    active: ActiveMap,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Tracker {
    pub fn new(ctx: TrackerContext, options: TrackerOptions) -> Self {
        Self {
            ctx,
            options,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveChain>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether a poll loop (or a `start` in progress) exists for the task.
    pub fn is_active(&self, task_id: TaskId) -> bool {
        self.lock_active().get(&task_id).is_some_and(|entry| {
            entry
                .handle
                .as_ref()
                .is_none_or(|handle| !handle.is_finished())
        })
    }

    pub fn active_count(&self) -> usize {
        self.lock_active()
            .values()
            .filter(|entry| entry.handle.as_ref().is_none_or(|h| !h.is_finished()))
            .count()
    }

    /// Claim the task's slot, failing with `AlreadyRunning` if taken.
    fn reserve(&self, task_id: TaskId) -> Result<(u64, CancellationToken)> {
        let mut active = self.lock_active();
        if let Some(existing) = active.get(&task_id) {
            let finished = existing.handle.as_ref().is_some_and(|h| h.is_finished());
            if !finished {
                return Err(ChainwatchError::AlreadyRunning(task_id));
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        active.insert(
            task_id,
            ActiveChain {
                generation,
                cancel: cancel.clone(),
                handle: None,
            },
        );
        Ok((generation, cancel))
    }

    fn release(&self, task_id: TaskId, generation: u64) {
        let mut active = self.lock_active();
        if active
            .get(&task_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            active.remove(&task_id);
        }
    }

    /// Trigger the first DAG of a pending task's chain and start polling.
    pub async fn start(&self, task_id: TaskId, opts: ExecuteOptions) -> Result<Execution> {
        let (generation, cancel) = self.reserve(task_id)?;

        match self.start_reserved(task_id, opts, generation, cancel).await {
            Ok(execution) => Ok(execution),
            Err(err) => {
                self.release(task_id, generation);
                Err(err)
            }
        }
    }

    async fn start_reserved(
        &self,
        task_id: TaskId,
        opts: ExecuteOptions,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<Execution> {
        let task = self.ctx.store.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(ChainwatchError::InvalidState(format!(
                "task {task_id} is {}; only pending tasks can be started",
                task.status
            )));
        }
        if task.dag_chain.is_empty() {
            return Err(ChainwatchError::Validation(format!(
                "task {task_id} has an empty dag_chain"
            )));
        }

        let base_parameters = merge_parameters(&task.parameters, opts.parameters.as_ref());
        let first_dag = task.dag_chain[0].clone();
        let conf = element_parameters(&base_parameters, &task.dag_chain, 0);
        let attempt = task.attempt + 1;

        let run_id = match self.ctx.airflow.trigger(&first_dag, &conf).await {
            Ok(run_id) => run_id,
            Err(err) => {
                warn!(%task_id, dag_id = %first_dag, error = %err, "triggering first DAG failed");
                self.fail_unstarted(&task, &first_dag, None, &err).await;
                return Err(err);
            }
        };

        let note = opts
            .note
            .unwrap_or_else(|| element_note(&task.dag_chain, 0));
        let run = WorkflowRun::queued(
            run_id.clone(),
            task_id,
            first_dag.clone(),
            0,
            attempt,
            conf,
            Some(note),
        );
        let task = match self.record_start(&run).await {
            Ok(task) => task,
            Err(err) => {
                warn!(%task_id, dag_id = %first_dag, run_id = %run_id, error = %err, "recording the started chain failed");
                self.abandon_run(&first_dag, &run_id, &err).await;
                self.fail_unstarted(&task, &first_dag, Some(&run_id), &err).await;
                return Err(err);
            }
        };

        info!(%task_id, dag_id = %first_dag, run_id = %run_id, chain_index = 0, total = task.dag_chain.len(), "chain started");
        self.ctx.emit(
            Event::new(EventKind::WorkflowTriggered, WorkflowStatus::Queued.as_str())
                .workflow(first_dag)
                .run(run_id.clone())
                .task(task_id)
                .user(task.user_id)
                .data(json!({ "chain_index": 0, "total_dags": task.dag_chain.len() })),
        );

        let state = ChainState::new(
            task_id,
            task.user_id,
            task.attempt,
            task.dag_chain.clone(),
            base_parameters,
            run_id,
        );
        let poller = ChainPoller {
            ctx: self.ctx.clone(),
            options: self.options,
            state,
            cancel,
            active: Arc::clone(&self.active),
            generation,
        };
        let handle = tokio::spawn(poller.run());

        {
            let mut active = self.lock_active();
            match active.get_mut(&task_id) {
                Some(entry) if entry.generation == generation => entry.handle = Some(handle),
                // The loop already finished and deregistered itself.
                _ => drop(handle),
            }
        }

        Ok(Execution {
            task,
            runs: vec![run],
        })
    }

    async fn record_start(&self, run: &WorkflowRun) -> Result<Task> {
        self.ctx.store.insert_run(run.clone()).await?;
        self.ctx
            .store
            .transition_task(run.task_id, &[TaskStatus::Pending], TaskStatus::Running)
            .await
    }

    /// Best-effort failure of a triggered run nothing will poll.
    async fn abandon_run(&self, dag_id: &str, run_id: &str, err: &ChainwatchError) {
        let update = RunUpdate::finished(WorkflowStatus::Failed).with_note(err.to_string());
        if let Err(store_err) = self.ctx.store.update_run(run_id, update).await {
            debug!(run_id = %run_id, error = %store_err, "abandoned run was not recorded");
        }
        if let Err(airflow_err) = self.ctx.airflow.set_run_state(dag_id, run_id, "failed").await {
            warn!(dag_id = %dag_id, run_id = %run_id, error = %airflow_err, "could not fail abandoned Airflow run");
        }
    }

    async fn fail_unstarted(
        &self,
        task: &Task,
        dag_id: &str,
        run_id: Option<&str>,
        err: &ChainwatchError,
    ) {
        let reason = err.to_string();
        let mut failed = Event::new(EventKind::WorkflowFailed, WorkflowStatus::Failed.as_str())
            .workflow(dag_id)
            .task(task.id)
            .user(task.user_id)
            .data(json!({ "chain_index": 0, "reason": reason }));
        if let Some(run_id) = run_id {
            failed = failed.run(run_id);
        }
        self.ctx.emit(failed);

        match self
            .ctx
            .store
            .transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Failed)
            .await
        {
            Ok(_) => {
                self.ctx.emit(
                    Event::new(EventKind::TaskFailed, TaskStatus::Failed.as_str())
                        .workflow(dag_id)
                        .task(task.id)
                        .user(task.user_id)
                        .data(json!({
                            "total_dags": task.dag_chain.len(),
                            "workflow_runs": run_id.into_iter().collect::<Vec<_>>(),
                            "reason": reason,
                        })),
                );
            }
            Err(store_err) => {
                warn!(task_id = %task.id, error = %store_err, "could not mark task failed");
            }
        }
    }

    /// Cancel a live chain. Its in-flight run is failed and the task becomes
    /// `cancelled`.
    pub async fn stop(&self, task_id: TaskId) -> Result<Task> {
        let entry = {
            let mut active = self.lock_active();
            match active.get(&task_id).map(|entry| entry.handle.is_some()) {
                None => None,
                Some(false) => {
                    return Err(ChainwatchError::InvalidState(format!(
                        "task {task_id} is still starting"
                    )));
                }
                Some(true) => active.remove(&task_id),
            }
        };

        let Some(entry) = entry else {
            // Surface TaskNotFound before InvalidState.
            let task = self.ctx.store.get_task(task_id).await?;
            return Err(ChainwatchError::InvalidState(format!(
                "task {task_id} has no active chain (status {})",
                task.status
            )));
        };

        entry.cancel.cancel();
        if let Some(handle) = entry.handle {
            if let Err(err) = handle.await {
                warn!(%task_id, error = %err, "chain poll loop ended abnormally");
            }
        }

        // The loop may have finished the task before it saw the cancellation.
        let task = self
            .ctx
            .store
            .transition_task(task_id, &[TaskStatus::Running], TaskStatus::Cancelled)
            .await?;

        let runs = self
            .ctx
            .store
            .runs_for_task(task_id, Some(task.attempt))
            .await?;
        let in_flight: Vec<WorkflowRun> = runs
            .into_iter()
            .filter(|run| !run.status.is_terminal())
            .collect();

        for run in &in_flight {
            let update = RunUpdate::finished(WorkflowStatus::Failed).with_note("stopped");
            if let Err(err) = self.ctx.store.update_run(&run.run_id, update).await {
                debug!(%task_id, run_id = %run.run_id, error = %err, "run already final");
            }
            if let Err(err) = self
                .ctx
                .airflow
                .set_run_state(&run.dag_id, &run.run_id, "failed")
                .await
            {
                warn!(%task_id, dag_id = %run.dag_id, run_id = %run.run_id, error = %err, "could not stop DAG run in Airflow");
            }

            self.ctx.emit(
                Event::new(EventKind::WorkflowStopped, WorkflowStatus::Failed.as_str())
                    .workflow(run.dag_id.clone())
                    .run(run.run_id.clone())
                    .task(task_id)
                    .user(task.user_id)
                    .data(json!({ "chain_index": run.chain_index })),
            );
        }

        let last_dag = in_flight
            .last()
            .map(|run| run.dag_id.clone())
            .or_else(|| task.dag_chain.first().cloned());
        let mut event = Event::new(EventKind::TaskCancelled, TaskStatus::Cancelled.as_str())
            .task(task_id)
            .user(task.user_id)
            .data(json!({ "total_dags": task.dag_chain.len() }));
        if let Some(dag_id) = last_dag {
            event = event.workflow(dag_id);
        }
        self.ctx.emit(event);

        info!(%task_id, "task stopped");
        Ok(task)
    }

    /// Reset a finished task to pending and start it again.
    pub async fn retry(&self, task_id: TaskId, opts: ExecuteOptions) -> Result<Execution> {
        let task = self.ctx.store.get_task(task_id).await?;
        match task.status {
            TaskStatus::Running => return Err(ChainwatchError::AlreadyRunning(task_id)),
            TaskStatus::Pending => {
                return Err(ChainwatchError::InvalidState(format!(
                    "task {task_id} is pending; execute it instead"
                )));
            }
            _ => {}
        }

        // A terminal task's loop is past its last store write; reap it.
        let finished = {
            let mut active = self.lock_active();
            match active.get(&task_id).map(|entry| entry.handle.is_some()) {
                Some(true) => active.remove(&task_id),
                Some(false) => return Err(ChainwatchError::AlreadyRunning(task_id)),
                None => None,
            }
        };
        if let Some(handle) = finished.and_then(|entry| entry.handle) {
            let _ = handle.await;
        }

        self.ctx
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled],
                TaskStatus::Pending,
            )
            .await?;
        info!(%task_id, previous = %task.status, "task reset for retry");

        self.start(task_id, opts).await
    }

    /// Cancel every poll loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<(TaskId, ActiveChain)> = self.lock_active().drain().collect();
        info!(count = entries.len(), "stopping chain poll loops");
        for (task_id, entry) in entries {
            if let Some(handle) = entry.handle {
                if let Err(err) = handle.await {
                    warn!(%task_id, error = %err, "chain poll loop ended abnormally");
                }
            }
        }
    }
}

/// Task parameters with `overrides` merged on top.
fn merge_parameters(base: &Value, overrides: Option<&Value>) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    if let Some(Value::Object(extra)) = overrides {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}
