use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use chainwatch::airflow::{AirflowApi, DagRunInfo};
use chainwatch::errors::{ChainwatchError, Result};

/// A trigger call the fake received.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerCall {
    pub dag_id: String,
    pub run_id: String,
    pub conf: Value,
}

#[derive(Default)]
struct Script {
    /// Per-DAG sequence of states returned by successive polls of one run.
    /// The last state repeats forever.
    states: HashMap<String, Vec<String>>,
    /// Poll count per run id.
    polls: HashMap<String, usize>,
    /// Runs whose next N polls fail with `UpstreamUnavailable`.
    failing_polls: HashMap<String, usize>,
    failing_triggers: Vec<String>,
    triggers: Vec<TriggerCall>,
    state_changes: Vec<(String, String, String)>,
    run_overrides: HashMap<String, VecDeque<String>>,
}

/// A scripted, in-memory Airflow.
///
/// - `script(dag, states)` sets what polls of that DAG's runs return.
/// - Unscripted DAGs succeed on the first poll.
/// - Every call is recorded for assertions.
#[derive(Clone, Default)]
pub struct FakeAirflow {
    inner: Arc<Mutex<Script>>,
    next_run: Arc<AtomicU64>,
}

impl FakeAirflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, dag_id: &str, states: &[&str]) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(dag_id.to_string(), states.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Make triggers of `dag_id` fail.
    pub fn fail_trigger(&self, dag_id: &str) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .failing_triggers
            .push(dag_id.to_string());
        self
    }

    /// Make the next `n` polls of every run of `dag_id` fail.
    pub fn fail_polls(&self, dag_id: &str, n: usize) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .failing_polls
            .insert(dag_id.to_string(), n);
        self
    }

    /// Force the state returned by upcoming polls of a single run.
    pub fn push_run_state(&self, run_id: &str, state: &str) {
        self.inner
            .lock()
            .unwrap()
            .run_overrides
            .entry(run_id.to_string())
            .or_default()
            .push_back(state.to_string());
    }

    pub fn triggers(&self) -> Vec<TriggerCall> {
        self.inner.lock().unwrap().triggers.clone()
    }

    pub fn triggered_dags(&self) -> Vec<String> {
        self.triggers().into_iter().map(|t| t.dag_id).collect()
    }

    pub fn poll_count(&self, run_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .polls
            .get(run_id)
            .copied()
            .unwrap_or(0)
    }

    /// `(dag_id, run_id, state)` of every `set_run_state` call.
    pub fn state_changes(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().state_changes.clone()
    }
}

#[async_trait]
impl AirflowApi for FakeAirflow {
    async fn trigger(&self, dag_id: &str, conf: &Value) -> Result<String> {
        let mut script = self.inner.lock().unwrap();
        if script.failing_triggers.iter().any(|d| d == dag_id) {
            debug!(dag_id, "fake airflow refusing trigger");
            return Err(ChainwatchError::UpstreamUnavailable(format!(
                "trigger of {dag_id} refused"
            )));
        }

        let n = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let run_id = format!("{dag_id}_run_{n}");
        debug!(dag_id, run_id = %run_id, "fake airflow triggered");
        script.triggers.push(TriggerCall {
            dag_id: dag_id.to_string(),
            run_id: run_id.clone(),
            conf: conf.clone(),
        });
        Ok(run_id)
    }

    async fn get_run(&self, dag_id: &str, run_id: &str) -> Result<DagRunInfo> {
        let mut script = self.inner.lock().unwrap();

        if let Some(remaining) = script.failing_polls.get_mut(dag_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ChainwatchError::UpstreamUnavailable(
                    "connection refused".to_string(),
                ));
            }
        }

        let poll = {
            let count = script.polls.entry(run_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let state = match script.run_overrides.get_mut(run_id).and_then(VecDeque::pop_front) {
            Some(state) => state,
            None => match script.states.get(dag_id) {
                Some(states) if !states.is_empty() => {
                    states[(poll - 1).min(states.len() - 1)].clone()
                }
                _ => "success".to_string(),
            },
        };

        Ok(DagRunInfo {
            dag_id: dag_id.to_string(),
            dag_run_id: run_id.to_string(),
            state: Some(state),
            start_date: None,
            end_date: None,
        })
    }

    async fn set_run_state(&self, dag_id: &str, run_id: &str, state: &str) -> Result<()> {
        self.inner.lock().unwrap().state_changes.push((
            dag_id.to_string(),
            run_id.to_string(),
            state.to_string(),
        ));
        Ok(())
    }
}
