// src/tracker/poller.rs

//! Per-task poll loop: the async shell around [`ChainState`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::airflow::DagRunInfo;
use crate::config::TrackerOptions;
use crate::events::{Event, EventKind};
use crate::store::{RunUpdate, WorkflowRun};
use crate::tracker::TrackerContext;
use crate::tracker::chain::{ChainCommand, ChainState, ChainStep};
use crate::tracker::service::ActiveChain;
use crate::types::{TaskId, TaskStatus, WorkflowStatus};

pub(crate) type ActiveMap = Arc<Mutex<HashMap<TaskId, ActiveChain>>>;

pub(crate) struct ChainPoller {
    pub(crate) ctx: TrackerContext,
    pub(crate) options: TrackerOptions,
    pub(crate) state: ChainState,
    pub(crate) cancel: CancellationToken,
    pub(crate) active: ActiveMap,
    pub(crate) generation: u64,
}

impl ChainPoller {
    pub(crate) async fn run(mut self) {
        let task_id = self.state.task_id();
        info!(%task_id, total = self.state.total(), "chain poll loop started");

        let mut last_seen = WorkflowStatus::Queued;
        // Set after the initial delay, then reset whenever the chain advances.
        let mut deadline: Option<Instant> = None;
        let mut delay = self.options.initial_delay;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(%task_id, "chain poll loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.options.poll_interval;

            let run_timeout = self.options.run_timeout;
            let deadline_at = *deadline.get_or_insert_with(|| Instant::now() + run_timeout);
            let index_before = self.state.index();
            let dag_id = self.state.current_dag().to_string();
            let run_id = self.state.current_run_id().to_string();

            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(%task_id, "chain poll loop cancelled during poll");
                    break;
                }
                res = self.ctx.airflow.get_run(&dag_id, &run_id) => res,
            };

            let outcome = match polled {
                Ok(info) => {
                    self.refresh(&info, &mut last_seen).await;
                    Some(info.outcome())
                }
                Err(err) => {
                    warn!(
                        %task_id,
                        dag_id = %dag_id,
                        run_id = %run_id,
                        chain_index = index_before,
                        error = %err,
                        "polling Airflow failed; retrying next tick"
                    );
                    None
                }
            };

            // A terminal answer always wins over the ceiling; the ceiling
            // only fails runs still unresolved after it passed.
            let expired = Instant::now() >= deadline_at;
            let step = match outcome {
                Some(outcome) if outcome.is_terminal() || !expired => {
                    self.state.on_outcome(outcome)
                }
                _ if expired => {
                    warn!(
                        %task_id,
                        dag_id = %dag_id,
                        run_id = %run_id,
                        chain_index = index_before,
                        "chain element exceeded its run timeout"
                    );
                    self.state.on_timeout()
                }
                _ => continue,
            };

            let keep_polling = self.apply(step).await;

            if self.state.index() != index_before {
                last_seen = WorkflowStatus::Queued;
                deadline = Some(Instant::now() + self.options.run_timeout);
            }

            if !keep_polling {
                break;
            }
        }

        self.deregister();
        debug!(%task_id, "chain poll loop finished");
    }

    /// Record Airflow's queued/running transitions on the WorkflowRun.
    async fn refresh(&self, info: &DagRunInfo, last_seen: &mut WorkflowStatus) {
        let Some(status) = info.intermediate_status() else {
            return;
        };
        if status == *last_seen {
            return;
        }

        let update = RunUpdate {
            status: Some(status),
            start_date: info.start_date,
            ..RunUpdate::default()
        };
        match self.ctx.store.update_run(&info.dag_run_id, update).await {
            Ok(_) => *last_seen = status,
            Err(err) => debug!(run_id = %info.dag_run_id, error = %err, "run refresh skipped"),
        }
    }

    /// Execute the commands of one step. Returns whether polling continues.
    async fn apply(&mut self, step: ChainStep) -> bool {
        let mut keep_polling = step.keep_polling;
        let mut queue: VecDeque<ChainCommand> = step.commands.into();

        while let Some(cmd) = queue.pop_front() {
            if let Some(follow_up) = self.execute(cmd).await {
                keep_polling = follow_up.keep_polling;
                queue.extend(follow_up.commands);
            }
        }

        keep_polling
    }

    async fn execute(&mut self, cmd: ChainCommand) -> Option<ChainStep> {
        let task_id = self.state.task_id();
        let user_id = self.state.user_id();
        let total = self.state.total();

        match cmd {
            ChainCommand::CompleteRun {
                index,
                dag_id,
                run_id,
            } => {
                if let Err(err) = self
                    .ctx
                    .store
                    .update_run(&run_id, RunUpdate::finished(WorkflowStatus::Success))
                    .await
                {
                    warn!(%task_id, run_id = %run_id, error = %err, "could not mark run successful");
                }
                info!(%task_id, dag_id = %dag_id, run_id = %run_id, chain_index = index, "DAG run succeeded");
                self.ctx.emit(
                    Event::new(EventKind::WorkflowCompleted, WorkflowStatus::Success.as_str())
                        .workflow(dag_id)
                        .run(run_id)
                        .task(task_id)
                        .user(user_id)
                        .data(json!({ "chain_index": index, "total_dags": total })),
                );
                None
            }

            ChainCommand::FailRun {
                index,
                dag_id,
                run_id,
                reason,
            } => {
                let update = RunUpdate::finished(WorkflowStatus::Failed).with_note(reason.clone());
                if let Err(err) = self.ctx.store.update_run(&run_id, update).await {
                    warn!(%task_id, run_id = %run_id, error = %err, "could not mark run failed");
                }
                warn!(
                    %task_id,
                    dag_id = %dag_id,
                    run_id = %run_id,
                    chain_index = index,
                    reason = %reason,
                    "DAG run failed"
                );
                self.ctx.emit(
                    Event::new(EventKind::WorkflowFailed, WorkflowStatus::Failed.as_str())
                        .workflow(dag_id)
                        .run(run_id)
                        .task(task_id)
                        .user(user_id)
                        .data(json!({ "chain_index": index, "reason": reason })),
                );
                None
            }

            ChainCommand::TriggerNext {
                index,
                dag_id,
                parameters,
                note,
            } => {
                if self.cancel.is_cancelled() {
                    debug!(%task_id, dag_id = %dag_id, "cancelled before triggering next element");
                    return Some(ChainStep {
                        commands: Vec::new(),
                        keep_polling: false,
                    });
                }

                match self.ctx.airflow.trigger(&dag_id, &parameters).await {
                    Ok(run_id) => {
                        let run = WorkflowRun::queued(
                            run_id.clone(),
                            task_id,
                            dag_id.clone(),
                            index,
                            self.state.attempt(),
                            parameters,
                            Some(note),
                        );
                        if let Err(err) = self.ctx.store.insert_run(run).await {
                            warn!(%task_id, run_id = %run_id, error = %err, "could not record run");
                        }
                        self.state.advance(run_id.clone());
                        info!(%task_id, dag_id = %dag_id, run_id = %run_id, chain_index = index, "triggered next DAG in chain");
                        self.ctx.emit(
                            Event::new(EventKind::WorkflowTriggered, WorkflowStatus::Queued.as_str())
                                .workflow(dag_id)
                                .run(run_id)
                                .task(task_id)
                                .user(user_id)
                                .data(json!({ "chain_index": index, "total_dags": total })),
                        );
                        None
                    }
                    Err(err) => {
                        warn!(%task_id, dag_id = %dag_id, chain_index = index, error = %err, "triggering next DAG failed");
                        Some(self.state.on_trigger_failed(index, err.to_string()))
                    }
                }
            }

            ChainCommand::ReportTriggerFailure {
                index,
                dag_id,
                reason,
            } => {
                self.ctx.emit(
                    Event::new(EventKind::WorkflowFailed, WorkflowStatus::Failed.as_str())
                        .workflow(dag_id)
                        .task(task_id)
                        .user(user_id)
                        .data(json!({ "chain_index": index, "reason": reason })),
                );
                None
            }

            ChainCommand::FinishTask {
                status,
                dag_id,
                reason,
            } => {
                match self
                    .ctx
                    .store
                    .transition_task(task_id, &[TaskStatus::Running], status)
                    .await
                {
                    Ok(_) => {
                        info!(%task_id, status = %status, "task finished");
                        let kind = if status == TaskStatus::Completed {
                            EventKind::TaskCompleted
                        } else {
                            EventKind::TaskFailed
                        };
                        self.ctx.emit(
                            Event::new(kind, status.as_str())
                                .workflow(dag_id)
                                .task(task_id)
                                .user(user_id)
                                .data(json!({
                                    "total_dags": total,
                                    "workflow_runs": self.state.run_ids(),
                                    "reason": reason,
                                })),
                        );
                    }
                    Err(err) => {
                        warn!(%task_id, status = %status, error = %err, "task finish lost to a concurrent update");
                    }
                }
                None
            }
        }
    }

    /// Drop this loop's registry entry unless a newer execution replaced it.
    fn deregister(&self) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if active
            .get(&self.state.task_id())
            .is_some_and(|entry| entry.generation == self.generation)
        {
            active.remove(&self.state.task_id());
        }
    }
}
