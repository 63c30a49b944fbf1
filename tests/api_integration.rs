//! Integration tests for the task-execution REST API.
//!
//! Spins up the full axum router with an in-memory SQLite database, without
//! spawning an actual agent CLI process.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use taskcore::criteria::AgentCriteriaChecker;
use taskcore::db::Database;
use taskcore::executor::Executor;
use taskcore::server::routes::create_router;
use taskcore::server::AppState;
use taskcore::test_runner::ShellTestRunner;

fn test_state() -> Arc<AppState> {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().unwrap();
    let agent_bin = "true".to_string();
    let criteria_checker = Arc::new(AgentCriteriaChecker::new(agent_bin.clone()));
    let test_runner = Arc::new(ShellTestRunner::new(None));
    let executor = Arc::new(Executor::new(db.clone(), agent_bin.clone(), criteria_checker, test_runner));
    let (dispatch_tx, _dispatch_rx) = tokio::sync::mpsc::unbounded_channel();
    Arc::new(AppState { db, executor, dispatch_tx, agent_bin })
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = create_router(test_state());
    let resp = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_task_persists_and_returns_pending() {
    let app = create_router(test_state());
    let resp = app
        .oneshot(json_request(
            "POST",
            "/tasks",
            json!({
                "name": "demo",
                "description": "write hello.py",
                "projects": [{"path": "/tmp/repo", "access": "write", "context": "", "project_type": "other"}],
            }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = json_body(resp).await;
    assert_eq!(body["name"], "demo");
    assert_eq!(body["status"], "PENDING");
    assert!(body["id"].as_str().is_some());
}

#[tokio::test]
async fn list_tasks_returns_created_task() {
    let state = test_state();
    let app = create_router(state.clone());

    app.clone()
        .oneshot(json_request("POST", "/tasks", json!({"name": "a", "description": "d"})))
        .await
        .unwrap();

    let resp = app
        .oneshot(Request::builder().uri("/tasks").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn get_task_404_for_unknown_id() {
    let app = create_router(test_state());
    let resp = app
        .oneshot(Request::builder().uri("/tasks/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn send_input_enqueues_and_reports_dispatched() {
    let state = test_state();
    let app = create_router(state.clone());

    let create_resp = app
        .clone()
        .oneshot(json_request("POST", "/tasks", json!({"name": "chat", "description": "", "chat_mode": true})))
        .await
        .unwrap();
    let task = json_body(create_resp).await;
    let task_id = task["id"].as_str().unwrap();

    let resp = app
        .oneshot(json_request("POST", &format!("/tasks/{task_id}/input"), json!({"text": "hello"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "dispatched");

    assert!(state.db.has_pending(task_id).unwrap());
}

#[tokio::test]
async fn duplicate_input_within_window_is_blocked() {
    let state = test_state();
    let app = create_router(state.clone());

    let create_resp = app
        .clone()
        .oneshot(json_request("POST", "/tasks", json!({"name": "chat", "description": "", "chat_mode": true})))
        .await
        .unwrap();
    let task = json_body(create_resp).await;
    let task_id = task["id"].as_str().unwrap().to_string();

    app.clone()
        .oneshot(json_request("POST", &format!("/tasks/{task_id}/input"), json!({"text": "retry"})))
        .await
        .unwrap();

    let second = app
        .oneshot(json_request("POST", &format!("/tasks/{task_id}/input"), json!({"text": "retry"})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let (pending, _sent, _entries) = state.db.queue_status(&task_id).unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn stop_task_sets_stopped_status() {
    let state = test_state();
    let app = create_router(state.clone());

    let create_resp = app
        .clone()
        .oneshot(json_request("POST", "/tasks", json!({"name": "stoppable", "description": "d"})))
        .await
        .unwrap();
    let task = json_body(create_resp).await;
    let task_id = task["id"].as_str().unwrap();

    let resp = app
        .oneshot(Request::builder().method("POST").uri(format!("/tasks/{task_id}/stop")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let reloaded = state.db.load_task(task_id).unwrap().unwrap();
    assert_eq!(reloaded.status, taskcore::db::models::TaskStatus::Stopped);
}
