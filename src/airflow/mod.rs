// src/airflow/mod.rs

//! Airflow REST API access.
//!
//! The tracker only talks to Airflow through [`AirflowApi`], so tests can
//! drive it with a scripted fake instead of [`AirflowClient`].

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::types::WorkflowStatus;

pub use client::AirflowClient;

/// Three-valued view of a DAG run as far as the chain is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunOutcome {
    Running,
    Success,
    Failed,
}

impl RunOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::Running)
    }
}

/// Map a raw Airflow `state` string.
///
/// `success` is success, `failed` and `upstream_failed` are failures, and
/// every other or unknown state (queued, running, scheduled, ...) counts as
/// still running.
pub fn map_state(state: &str) -> RunOutcome {
    match state.trim().to_ascii_lowercase().as_str() {
        "success" => RunOutcome::Success,
        "failed" | "upstream_failed" => RunOutcome::Failed,
        _ => RunOutcome::Running,
    }
}

/// Subset of Airflow's `DAGRun` resource that the tracker needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRunInfo {
    pub dag_id: String,
    pub dag_run_id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl DagRunInfo {
    pub fn outcome(&self) -> RunOutcome {
        self.state.as_deref().map(map_state).unwrap_or(RunOutcome::Running)
    }

    /// Intermediate status to record on the WorkflowRun, if Airflow reports
    /// one we track (`queued` or `running`).
    pub fn intermediate_status(&self) -> Option<WorkflowStatus> {
        match self.state.as_deref().map(str::trim) {
            Some("queued") => Some(WorkflowStatus::Queued),
            Some("running") => Some(WorkflowStatus::Running),
            _ => None,
        }
    }
}

#[async_trait]
pub trait AirflowApi: Send + Sync {
    /// Trigger a new run of `dag_id` with `conf` and return its `dag_run_id`.
    async fn trigger(&self, dag_id: &str, conf: &Value) -> Result<String>;

    /// Fetch a DAG run.
    async fn get_run(&self, dag_id: &str, run_id: &str) -> Result<DagRunInfo>;

    async fn get_status(&self, dag_id: &str, run_id: &str) -> Result<RunOutcome> {
        Ok(self.get_run(dag_id, run_id).await?.outcome())
    }

    /// Force a DAG run into `state` (Airflow accepts `success`, `failed`,
    /// `queued`).
    async fn set_run_state(&self, dag_id: &str, run_id: &str, state: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn airflow_states_map_to_three_outcomes() {
        assert_eq!(map_state("success"), RunOutcome::Success);
        assert_eq!(map_state("failed"), RunOutcome::Failed);
        assert_eq!(map_state("upstream_failed"), RunOutcome::Failed);
        assert_eq!(map_state("queued"), RunOutcome::Running);
        assert_eq!(map_state("running"), RunOutcome::Running);
        assert_eq!(map_state("scheduled"), RunOutcome::Running);
        assert_eq!(map_state("something_new"), RunOutcome::Running);
    }

    #[test]
    fn missing_state_counts_as_running() {
        let info: DagRunInfo = serde_json::from_value(serde_json::json!({
            "dag_id": "a",
            "dag_run_id": "r1",
            "state": null,
        }))
        .unwrap();
        assert_eq!(info.outcome(), RunOutcome::Running);
        assert_eq!(info.intermediate_status(), None);
    }

    #[test]
    fn parses_airflow_dates() {
        let info: DagRunInfo = serde_json::from_value(serde_json::json!({
            "dag_id": "a",
            "dag_run_id": "r1",
            "state": "running",
            "start_date": "2024-05-01T10:00:00+00:00",
            "end_date": null,
            "conf": {}
        }))
        .unwrap();
        assert!(info.start_date.is_some());
        assert_eq!(info.intermediate_status(), Some(WorkflowStatus::Running));
    }
}
