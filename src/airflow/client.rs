// src/airflow/client.rs

//! `reqwest`-backed implementation of [`AirflowApi`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::airflow::{AirflowApi, DagRunInfo};
use crate::config::{AirflowAuth, AirflowSettings};
use crate::errors::{ChainwatchError, Result};

/// HTTP client for the Airflow stable REST API (`/api/v1`).
pub struct AirflowClient {
    client: Client,
    base_url: String,
    auth: AirflowAuth,
    retry_attempts: u32,
    retry_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    dag_run_id: Option<String>,
}

impl AirflowClient {
    /// Creates a new client from validated settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(settings: &AirflowSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ChainwatchError::ConfigError(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth: settings.auth.clone(),
            retry_attempts: settings.retry_attempts.max(1),
            retry_backoff: settings.retry_backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, self.url(path));
        match &self.auth {
            AirflowAuth::None => req,
            AirflowAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
            AirflowAuth::Bearer(token) => req.bearer_auth(token),
        }
    }

    /// Send with bounded retries.
    ///
    /// Connection failures and 5xx answers are retried with exponential
    /// backoff; timeouts and other statuses are returned as-is. The returned
    /// response may still carry a non-success status.
    async fn execute(&self, req: RequestBuilder) -> Result<Response> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let retries_left = attempt < self.retry_attempts;

            let this_try = match req.try_clone() {
                Some(cloned) if retries_left => cloned,
                _ => return req.send().await.map_err(request_failed),
            };

            match this_try.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(
                        attempt,
                        status = %resp.status(),
                        url = %resp.url(),
                        "Airflow answered with a server error; retrying"
                    );
                }
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_connect() => {
                    warn!(attempt, error = %err, "Airflow unreachable; retrying");
                }
                Err(err) => return Err(request_failed(err)),
            }

            tokio::time::sleep(backoff(self.retry_backoff, attempt)).await;
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let response = self.execute(req).await?;
        ensure_success(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ChainwatchError::UpstreamUnavailable(format!("invalid response body: {e}")))
    }
}

fn request_failed(err: reqwest::Error) -> ChainwatchError {
    ChainwatchError::UpstreamUnavailable(format!("request failed: {err}"))
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ChainwatchError::UpstreamUnavailable(format!(
            "Airflow API error ({status}): {body}"
        )))
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at 16x `base`.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(4);
    base.saturating_mul(factor)
}

/// Run id submitted with each trigger, unique per call.
pub fn generate_run_id() -> String {
    format!(
        "chainwatch_{}_{}",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        Uuid::new_v4().simple()
    )
}

#[async_trait]
impl AirflowApi for AirflowClient {
    async fn trigger(&self, dag_id: &str, conf: &Value) -> Result<String> {
        let run_id = generate_run_id();
        let body = json!({ "dag_run_id": run_id, "conf": conf });
        let req = self
            .request(Method::POST, &format!("/dags/{dag_id}/dagRuns"))
            .json(&body);

        // The run id is fixed before the first attempt, so a retried POST
        // that already landed comes back as 409 for the same run.
        let response = self.execute(req).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(dag_id, run_id = %run_id, "DAG run already exists; treating trigger as done");
            return Ok(run_id);
        }

        let created: TriggerResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| ChainwatchError::UpstreamUnavailable(format!("invalid response body: {e}")))?;
        let run_id = created.dag_run_id.unwrap_or(run_id);
        debug!(dag_id, run_id = %run_id, "triggered DAG run");
        Ok(run_id)
    }

    async fn get_run(&self, dag_id: &str, run_id: &str) -> Result<DagRunInfo> {
        let req = self.request(Method::GET, &format!("/dags/{dag_id}/dagRuns/{run_id}"));
        self.send_json(req).await
    }

    async fn set_run_state(&self, dag_id: &str, run_id: &str, state: &str) -> Result<()> {
        let req = self
            .request(Method::PATCH, &format!("/dags/{dag_id}/dagRuns/{run_id}"))
            .json(&json!({ "state": state }));
        self.send(req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_prefixed() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert!(a.starts_with("chainwatch_"));
        assert_ne!(a, b);
    }

    #[test]
    fn backoff_doubles_up_to_a_cap() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 2), Duration::from_millis(200));
        assert_eq!(backoff(base, 3), Duration::from_millis(400));
        assert_eq!(backoff(base, 9), Duration::from_millis(1600));
    }

    #[test]
    fn urls_are_rooted_at_api_v1() {
        let client = AirflowClient::new(&AirflowSettings {
            base_url: "http://airflow:8080/".to_string(),
            ..AirflowSettings::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://airflow:8080");
        assert_eq!(
            client.url("/dags/a/dagRuns"),
            "http://airflow:8080/api/v1/dags/a/dagRuns"
        );
    }
}
