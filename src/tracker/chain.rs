// src/tracker/chain.rs

//! Pure chain state machine.
//!
//! [`ChainState`] consumes poll outcomes and produces [`ChainCommand`]s for
//! the IO shell (`poller.rs`) to execute. It never touches Airflow, the store
//! or the event bus, so the chain rules can be tested without Tokio.

use serde_json::{Map, Value, json};

use crate::airflow::RunOutcome;
use crate::errors::ChainwatchError;
use crate::types::{TaskId, TaskStatus, UserId};

/// What the IO shell should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainCommand {
    /// Mark the current WorkflowRun successful.
    CompleteRun {
        index: usize,
        dag_id: String,
        run_id: String,
    },
    /// Mark the current WorkflowRun failed.
    FailRun {
        index: usize,
        dag_id: String,
        run_id: String,
        reason: String,
    },
    /// Trigger the chain element at `index`.
    TriggerNext {
        index: usize,
        dag_id: String,
        parameters: Value,
        note: String,
    },
    /// Triggering the element at `index` failed; no run exists for it.
    ReportTriggerFailure {
        index: usize,
        dag_id: String,
        reason: String,
    },
    /// Move the task to its terminal status.
    FinishTask {
        status: TaskStatus,
        dag_id: String,
        reason: Option<String>,
    },
}

/// Result of one core step.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStep {
    pub commands: Vec<ChainCommand>,
    pub keep_polling: bool,
}

impl ChainStep {
    fn idle(keep_polling: bool) -> Self {
        Self {
            commands: Vec::new(),
            keep_polling,
        }
    }
}

/// In-memory progress of one task execution, owned by its poll loop.
#[derive(Debug, Clone)]
pub struct ChainState {
    task_id: TaskId,
    user_id: Option<UserId>,
    attempt: u32,
    chain: Vec<String>,
    base_parameters: Value,
    index: usize,
    run_ids: Vec<String>,
    finished: bool,
}

impl ChainState {
    /// State right after `chain[0]` was triggered as `first_run_id`.
    ///
    /// `chain` must not be empty.
    pub fn new(
        task_id: TaskId,
        user_id: Option<UserId>,
        attempt: u32,
        chain: Vec<String>,
        base_parameters: Value,
        first_run_id: String,
    ) -> Self {
        debug_assert!(!chain.is_empty());
        Self {
            task_id,
            user_id,
            attempt,
            chain,
            base_parameters,
            index: 0,
            run_ids: vec![first_run_id],
            finished: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn total(&self) -> usize {
        self.chain.len()
    }

    pub fn current_dag(&self) -> &str {
        &self.chain[self.index]
    }

    pub fn current_run_id(&self) -> &str {
        &self.run_ids[self.index]
    }

    pub fn run_ids(&self) -> &[String] {
        &self.run_ids
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parameters sent as Airflow `conf` for the element at `index`.
    pub fn parameters_for(&self, index: usize) -> Value {
        element_parameters(&self.base_parameters, &self.chain, index)
    }

    /// Apply one poll outcome for the current element.
    pub fn on_outcome(&mut self, outcome: RunOutcome) -> ChainStep {
        if self.finished {
            return ChainStep::idle(false);
        }

        match outcome {
            RunOutcome::Running => ChainStep::idle(true),
            RunOutcome::Success => {
                let mut commands = vec![ChainCommand::CompleteRun {
                    index: self.index,
                    dag_id: self.current_dag().to_string(),
                    run_id: self.current_run_id().to_string(),
                }];

                let next = self.index + 1;
                if next < self.chain.len() {
                    commands.push(ChainCommand::TriggerNext {
                        index: next,
                        dag_id: self.chain[next].clone(),
                        parameters: self.parameters_for(next),
                        note: element_note(&self.chain, next),
                    });
                    ChainStep {
                        commands,
                        keep_polling: true,
                    }
                } else {
                    self.finished = true;
                    commands.push(ChainCommand::FinishTask {
                        status: TaskStatus::Completed,
                        dag_id: self.current_dag().to_string(),
                        reason: None,
                    });
                    ChainStep {
                        commands,
                        keep_polling: false,
                    }
                }
            }
            RunOutcome::Failed => self.fail_current("failed".to_string()),
        }
    }

    /// The current element exceeded its deadline without a terminal state.
    pub fn on_timeout(&mut self) -> ChainStep {
        if self.finished {
            return ChainStep::idle(false);
        }
        self.fail_current("timeout".to_string())
    }

    /// Record that `run_id` was created for the element following the
    /// current one.
    pub fn advance(&mut self, run_id: String) {
        if self.finished || self.index + 1 >= self.chain.len() {
            return;
        }
        self.index += 1;
        self.run_ids.push(run_id);
    }

    /// Triggering the element at `index` failed.
    pub fn on_trigger_failed(&mut self, index: usize, reason: String) -> ChainStep {
        if self.finished {
            return ChainStep::idle(false);
        }
        self.finished = true;

        let dag_id = self.chain.get(index).cloned().unwrap_or_default();
        let failure = ChainwatchError::ChainElementFailed {
            index,
            dag_id: dag_id.clone(),
            reason: reason.clone(),
        };
        ChainStep {
            commands: vec![
                ChainCommand::ReportTriggerFailure {
                    index,
                    dag_id: dag_id.clone(),
                    reason,
                },
                ChainCommand::FinishTask {
                    status: TaskStatus::Failed,
                    dag_id,
                    reason: Some(failure.to_string()),
                },
            ],
            keep_polling: false,
        }
    }

    fn fail_current(&mut self, reason: String) -> ChainStep {
        self.finished = true;

        let dag_id = self.current_dag().to_string();
        let failure = ChainwatchError::ChainElementFailed {
            index: self.index,
            dag_id: dag_id.clone(),
            reason: reason.clone(),
        };
        ChainStep {
            commands: vec![
                ChainCommand::FailRun {
                    index: self.index,
                    dag_id: dag_id.clone(),
                    run_id: self.current_run_id().to_string(),
                    reason,
                },
                ChainCommand::FinishTask {
                    status: TaskStatus::Failed,
                    dag_id,
                    reason: Some(failure.to_string()),
                },
            ],
            keep_polling: false,
        }
    }
}

/// `base` extended with the chain position keys.
///
/// Non-object `base` values are replaced by an empty object.
pub fn element_parameters(base: &Value, chain: &[String], index: usize) -> Value {
    let mut params: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    params.insert("dag_chain_index".to_string(), json!(index));
    params.insert("dag_chain_total".to_string(), json!(chain.len()));
    params.insert(
        "next_dag".to_string(),
        chain.get(index + 1).map_or(Value::Null, |d| json!(d)),
    );
    Value::Object(params)
}

pub fn element_note(chain: &[String], index: usize) -> String {
    format!(
        "DAG chain {}/{}: {}",
        index + 1,
        chain.len(),
        chain.get(index).map(String::as_str).unwrap_or_default()
    )
}
