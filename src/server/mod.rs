pub mod routes;
pub mod sse;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::db::Database;
use crate::executor::Executor;
use crate::interrupt::DispatchMessage;

pub struct AppState {
    pub db: Database,
    pub executor: Arc<Executor>,
    pub dispatch_tx: mpsc::UnboundedSender<DispatchMessage>,
    pub agent_bin: String,
}

pub async fn run(
    state: Arc<AppState>,
    port: u16,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchMessage>,
) -> anyhow::Result<()> {
    let dispatch_state = state.clone();
    tokio::spawn(dispatch_loop(dispatch_state, dispatch_rx));

    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!("taskcore server listening on port {port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Consumes `DispatchMessage`s and spawns one `execute_task` future per
/// message. Per-task serialization is enforced inside `execute_task` itself
/// via the CAS claim on `status`, so a task already running is a cheap
/// no-op here rather than something this loop needs to track.
async fn dispatch_loop(state: Arc<AppState>, mut rx: mpsc::UnboundedReceiver<DispatchMessage>) {
    tracing::info!("dispatch loop started");

    while let Some(msg) = rx.recv().await {
        let executor = state.executor.clone();
        let task_id = msg.task_id;
        tokio::spawn(async move {
            if let Err(e) = executor.execute_task(&task_id).await {
                tracing::error!("task {} exited with error: {}", task_id, e);
            }
        });
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    tracing::info!("shutting down");
}
