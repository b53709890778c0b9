// src/api/routes.rs

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::api::dto::{
    CreateTaskRequest, ExecuteRequest, ExecuteResponse, HealthResponse, TaskStatusResponse,
};
use crate::api::error::{ApiError, ApiResult};
use crate::events::Topic;
use crate::relay::{RegistryStats, serve_socket};
use crate::store::{NewTask, Task};
use crate::tracker::{ExecuteOptions, Execution};
use crate::types::{TaskId, UserId};

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

/// Parse an optional JSON body; an empty body yields `T::default()`.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        active_chains: state.tracker.active_count(),
        websocket_connections: state.registry.len(),
    })
}

pub async fn create_task(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let req: CreateTaskRequest = parse_body(&body)?;
    let dag_chain = req
        .dag_chain
        .unwrap_or_else(|| state.default_chain.as_ref().clone());
    if dag_chain.is_empty() {
        return Err(ApiError::bad_request(
            "dag_chain is empty and no default chain is configured",
        ));
    }

    let task = state
        .store
        .create_task(NewTask {
            name: req.name,
            dag_chain,
            user_id: req.user_id,
            parameters: req.parameters.unwrap_or_else(|| json!({})),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.store.list_tasks().await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.store.get_task(task_id).await?))
}

fn execute_response(execution: Execution, message: &str) -> ExecuteResponse {
    ExecuteResponse {
        task_id: execution.task.id,
        status: execution.task.status,
        total_dags: execution.task.dag_chain.len(),
        workflow_runs: execution.runs,
        message: message.to_string(),
    }
}

pub async fn execute_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ExecuteResponse>)> {
    let req: ExecuteRequest = optional_body(&body)?;
    let execution = state
        .tracker
        .start(
            task_id,
            ExecuteOptions {
                parameters: req.parameters,
                note: req.note,
            },
        )
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(execute_response(execution, "DAG chain started")),
    ))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ExecuteResponse>)> {
    let req: ExecuteRequest = optional_body(&body)?;
    let execution = state
        .tracker
        .retry(
            task_id,
            ExecuteOptions {
                parameters: req.parameters,
                note: req.note,
            },
        )
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(execute_response(execution, "DAG chain restarted")),
    ))
}

pub async fn stop_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.tracker.stop(task_id).await?))
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<TaskStatusResponse>> {
    let task = state.store.get_task(task_id).await?;
    let runs = state
        .store
        .runs_for_task(task_id, Some(task.attempt))
        .await?;
    Ok(Json(TaskStatusResponse::new(task, runs)))
}

pub async fn ws_stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, topics: Vec<Topic>) -> Response {
    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| serve_socket(socket, registry, topics))
}

pub async fn ws_global(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, vec![Topic::Global])
}

pub async fn ws_user(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Response {
    upgrade(ws, state, vec![Topic::User { user_id }])
}

pub async fn ws_workflow(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Response {
    upgrade(ws, state, vec![Topic::Workflow { workflow_id }])
}

pub async fn ws_user_workflow(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((user_id, workflow_id)): Path<(UserId, String)>,
) -> Response {
    upgrade(
        ws,
        state,
        vec![Topic::UserWorkflow {
            user_id,
            workflow_id,
        }],
    )
}

pub async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "code": "NOT_FOUND", "message": "no such route" })),
    )
}
