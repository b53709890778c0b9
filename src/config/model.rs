// src/config/model.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [server]
/// bind = "0.0.0.0:8000"
///
/// [airflow]
/// base_url = "http://localhost:8080"
/// username = "admin"
/// password = "admin"
/// request_timeout = "30s"
/// retry_attempts = 3
/// retry_backoff = "1s"
///
/// [tracker]
/// poll_interval = "30s"
/// initial_delay = "0s"
/// run_timeout = "1h"
///
/// [events]
/// capacity = 1024
/// client_queue = 64
///
/// [chain]
/// default_dags = ["data_processing_pipeline", "ml_training_pipeline"]
/// ```
///
/// All sections are optional and have reasonable defaults. Durations stay as
/// strings here; [`ConfigFile`] holds the parsed form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub airflow: RawAirflowSection,

    #[serde(default)]
    pub tracker: RawTrackerSection,

    #[serde(default)]
    pub events: EventsSection,

    #[serde(default)]
    pub chain: ChainSection,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    /// Socket address the HTTP/WebSocket server listens on.
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// `[airflow]` section as written in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAirflowSection {
    #[serde(default = "default_airflow_url")]
    pub base_url: String,

    /// Basic-auth user. An empty string disables basic auth.
    #[serde(default = "default_credential")]
    pub username: Option<String>,

    #[serde(default = "default_credential")]
    pub password: Option<String>,

    /// Bearer token; takes precedence over username/password when set.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Attempts per Airflow request; connection errors and 5xx answers are
    /// retried.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first retry; doubles on each further attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: String,
}

fn default_airflow_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> String {
    "1s".to_string()
}

fn default_credential() -> Option<String> {
    Some("admin".to_string())
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for RawAirflowSection {
    fn default() -> Self {
        Self {
            base_url: default_airflow_url(),
            username: default_credential(),
            password: default_credential(),
            token: None,
            request_timeout: default_request_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

/// `[tracker]` section as written in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTrackerSection {
    /// How often each in-flight chain polls Airflow.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Wait before the first poll of a freshly triggered DAG.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    /// Ceiling for a single chain element; exceeding it fails the chain.
    #[serde(default = "default_run_timeout")]
    pub run_timeout: String,
}

fn default_poll_interval() -> String {
    "30s".to_string()
}

fn default_initial_delay() -> String {
    "0s".to_string()
}

fn default_run_timeout() -> String {
    "1h".to_string()
}

impl Default for RawTrackerSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            initial_delay: default_initial_delay(),
            run_timeout: default_run_timeout(),
        }
    }
}

/// `[events]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsSection {
    /// Capacity of the shared broadcast channel. Lagging subscribers lose the
    /// oldest events once it is exceeded.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Outbound queue length per WebSocket connection. A connection whose
    /// queue is full is dropped.
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

fn default_capacity() -> usize {
    1024
}

fn default_client_queue() -> usize {
    64
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            client_queue: default_client_queue(),
        }
    }
}

/// `[chain]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChainSection {
    /// Chain used for tasks created without an explicit `dag_chain`.
    #[serde(default)]
    pub default_dags: Vec<String>,
}

/// How the Airflow client authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum AirflowAuth {
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

impl std::fmt::Debug for AirflowAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AirflowAuth::None => f.write_str("None"),
            AirflowAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AirflowAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Validated Airflow connection settings.
#[derive(Debug, Clone)]
pub struct AirflowSettings {
    pub base_url: String,
    pub auth: AirflowAuth,
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for AirflowSettings {
    fn default() -> Self {
        Self {
            base_url: default_airflow_url(),
            auth: AirflowAuth::Basic {
                username: "admin".to_string(),
                password: "admin".to_string(),
            },
            request_timeout: Duration::from_secs(30),
            retry_attempts: default_retry_attempts(),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Validated timing of the chain poll loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    pub poll_interval: Duration,
    pub initial_delay: Duration,
    pub run_timeout: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            initial_delay: Duration::ZERO,
            run_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Validated configuration.
///
/// Construct through `ConfigFile::try_from(RawConfigFile)` (see
/// `validate.rs`) or [`ConfigFile::default`].
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub airflow: AirflowSettings,
    pub tracker: TrackerOptions,
    pub events: EventsSection,
    pub chain: ChainSection,
}
