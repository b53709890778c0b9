// src/api/mod.rs

//! HTTP and WebSocket surface.

pub mod dto;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::relay::Registry;
use crate::store::TaskStore;
use crate::tracker::Tracker;

pub use error::{ApiError, ApiResult};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<Tracker>,
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<Registry>,
    /// Chain used when `POST /tasks` omits `dag_chain`.
    pub default_chain: Arc<Vec<String>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/tasks", post(routes::create_task).get(routes::list_tasks))
        .route("/tasks/:id", get(routes::get_task))
        .route("/tasks/:id/execute", post(routes::execute_task))
        .route("/tasks/:id/status", get(routes::task_status))
        .route("/tasks/:id/stop", post(routes::stop_task))
        .route("/tasks/:id/retry", post(routes::retry_task))
        .route("/ws", get(routes::ws_global))
        .route("/ws/stats", get(routes::ws_stats))
        .route("/ws/user/:user_id", get(routes::ws_user))
        .route("/ws/workflow/:workflow_id", get(routes::ws_workflow))
        .route(
            "/ws/user/:user_id/workflow/:workflow_id",
            get(routes::ws_user_workflow),
        )
        .fallback(routes::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
