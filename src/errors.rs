// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::types::TaskId;

#[derive(Error, Debug)]
pub enum ChainwatchError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Workflow run not found: {0}")]
    RunNotFound(String),

    /// Airflow was unreachable, timed out, or answered with a non-2xx status.
    #[error("Airflow unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Task {0} already has an active DAG chain")]
    AlreadyRunning(TaskId),

    #[error("Chain element {index} ({dag_id}) failed: {reason}")]
    ChainElementFailed {
        index: usize,
        dag_id: String,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ChainwatchError>;
