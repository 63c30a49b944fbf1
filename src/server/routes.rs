use std::sync::Arc;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::db::queries::CreateTask;
use crate::interrupt::{self, InterruptOutcome};
use crate::server::sse;
use crate::server::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/input", post(send_input))
        .route("/tasks/{id}/stop", post(stop_task))
        .route("/tasks/{id}/restart", post(restart_task))
        .route("/tasks/{id}/clear-restart", post(clear_and_restart_task))
        .route("/tasks/{id}/interactions", get(list_interactions))
        .route("/tasks/{id}/stream", get(sse::task_event_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn err_response(e: impl std::fmt::Display) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateTask>,
) -> impl IntoResponse {
    match state.db.create_task(&input) {
        Ok(task) => {
            let _ = state.dispatch_tx.send(crate::interrupt::DispatchMessage { task_id: task.id.clone() });
            (StatusCode::CREATED, Json(json!(task))).into_response()
        }
        Err(e) => err_response(e),
    }
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.list_tasks() {
        Ok(tasks) => Json(json!(tasks)).into_response(),
        Err(e) => err_response(e),
    }
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.db.load_task(&id) {
        Ok(Some(task)) => Json(json!(task)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "task not found"}))).into_response(),
        Err(e) => err_response(e),
    }
}

async fn list_interactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.db.list_interactions(&id) {
        Ok(interactions) => Json(json!(interactions)).into_response(),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
pub struct SendInput {
    pub text: String,
    #[serde(default)]
    pub images: Option<Vec<String>>,
}

async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<SendInput>,
) -> impl IntoResponse {
    match interrupt::interrupt(
        &state.db,
        &state.dispatch_tx,
        &state.agent_bin,
        &id,
        &input.text,
        input.images.as_deref(),
    )
    .await
    {
        Ok(InterruptOutcome::Blocked) => {
            (StatusCode::CONFLICT, Json(json!({"status": "blocked"}))).into_response()
        }
        Ok(InterruptOutcome::Dispatched) => {
            Json(json!({"status": "dispatched"})).into_response()
        }
        Err(e) => err_response(e),
    }
}

async fn stop_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.executor.stop_task(&id).await {
        Ok(()) => Json(json!({"status": "stopped"})).into_response(),
        Err(e) => err_response(e),
    }
}

async fn restart_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.restart_task(&id).await {
        Ok(()) => {
            let _ = state.dispatch_tx.send(crate::interrupt::DispatchMessage { task_id: id });
            Json(json!({"status": "restarted"})).into_response()
        }
        Err(e) => err_response(e),
    }
}

async fn clear_and_restart_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.executor.clear_and_restart_task(&id).await {
        Ok(()) => {
            let _ = state.dispatch_tx.send(crate::interrupt::DispatchMessage { task_id: id });
            Json(json!({"status": "restarted"})).into_response()
        }
        Err(e) => err_response(e),
    }
}
