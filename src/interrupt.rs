//! Immediate-Interrupt Path: delivers a new user message to a task without
//! waiting for its current iteration (if any) to notice the queue on its
//! own. The only caller outside this module is the server layer — handling
//! an inbound "send input" request for a task that may be mid-turn.

use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;

use crate::agent_driver::{self, RunRequest};
use crate::db::models::{InteractionType, Task, TaskPatch, Usage};
use crate::db::Database;
use crate::error::{AgentDriverError, ExecutorError, QueueError};

/// Enqueued on the dispatch channel to (re)schedule a task's worker.
/// Carries only an id, mirroring the donor's dispatch shape but scoped to
/// a single task instead of a goal-space batch.
#[derive(Debug, Clone)]
pub struct DispatchMessage {
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Identical text already pending within the dedup window; not enqueued.
    Blocked,
    /// Enqueued, and a worker is scheduled (or already running) to consume it.
    Dispatched,
}

/// Delivers `text` to `task_id`. If the task has an active child, it is
/// killed and the message is sent directly against the existing session
/// before the normal loop is rescheduled; otherwise the message is left for
/// the next worker invocation to pick up.
pub async fn interrupt(
    db: &Database,
    dispatch_tx: &UnboundedSender<DispatchMessage>,
    agent_bin: &str,
    task_id: &str,
    text: &str,
    images: Option<&[String]>,
) -> Result<InterruptOutcome, ExecutorError> {
    match db.enqueue_input(task_id, text, images) {
        Ok(_entry) => {}
        Err(QueueError::Duplicate) => return Ok(InterruptOutcome::Blocked),
        Err(e) => return Err(e.into()),
    }

    let task = db
        .load_task(task_id)?
        .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()))?;

    let Some(pid) = task.process_pid else {
        dispatch(dispatch_tx, task_id);
        return Ok(InterruptOutcome::Dispatched);
    };

    agent_driver::terminate(pid as u32).await;
    db.update_task(task_id, &TaskPatch { process_pid: Some(None), ..Default::default() })?;

    run_immediate_turn(db, agent_bin, task_id, &task, text, images).await?;

    dispatch(dispatch_tx, task_id);
    Ok(InterruptOutcome::Dispatched)
}

fn dispatch(dispatch_tx: &UnboundedSender<DispatchMessage>, task_id: &str) {
    let _ = dispatch_tx.send(DispatchMessage { task_id: task_id.to_string() });
}

/// Sends `text` directly via the Agent Driver against the task's existing
/// session, retrying once with a cleared session if the Agent rejects it.
/// Marks the queue entry sent and logs both sides of the turn. Runs exactly
/// one turn; the caller schedules the normal iteration loop afterward.
async fn run_immediate_turn(
    db: &Database,
    agent_bin: &str,
    task_id: &str,
    task: &Task,
    text: &str,
    images: Option<&[String]>,
) -> Result<(), ExecutorError> {
    db.mark_sent(task_id, text)?;
    db.append_interaction(task_id, InteractionType::UserRequest, text, images, &Usage::default())?;

    let cwd = PathBuf::from(task.initial_cwd());
    let images_owned: Vec<String> = images.map(|v| v.to_vec()).unwrap_or_default();

    let req = RunRequest {
        agent_bin,
        message: text,
        cwd: &cwd,
        session_id: task.agent_session_id.as_deref(),
        images: &images_owned,
        mcp_servers: task.mcp_servers.as_ref(),
    };

    let outcome = match agent_driver::run(req, |_| {}, |_| {}).await {
        Err(AgentDriverError::SessionMissing(_)) => {
            db.update_task(
                task_id,
                &TaskPatch { agent_session_id: Some(None), ..Default::default() },
            )?;
            let retry_req = RunRequest {
                agent_bin,
                message: text,
                cwd: &cwd,
                session_id: None,
                images: &images_owned,
                mcp_servers: task.mcp_servers.as_ref(),
            };
            agent_driver::run(retry_req, |_| {}, |_| {}).await.map_err(ExecutorError::from)
        }
        Ok(o) => Ok(o),
        Err(e) => Err(ExecutorError::from(e)),
    }?;

    db.update_task(
        task_id,
        &TaskPatch {
            agent_session_id: Some(
                outcome.session_id.clone().or_else(|| task.agent_session_id.clone()),
            ),
            ..Default::default()
        },
    )?;
    db.append_interaction(
        task_id,
        InteractionType::ClaudeResponse,
        &outcome.text,
        None,
        &outcome.usage,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::CreateTask;

    fn fake_agent(script: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-agent.sh");
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (dir, path.to_string_lossy().into_owned())
    }

    fn new_task(db: &Database) -> String {
        db.create_task(&CreateTask {
            name: "interrupt-demo".to_string(),
            description: "do something".to_string(),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn duplicate_within_window_is_blocked() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let task_id = new_task(&db);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        interrupt(&db, &tx, "true", &task_id, "hello", None).await.unwrap();
        let second = interrupt(&db, &tx, "true", &task_id, "hello", None).await.unwrap();
        assert_eq!(second, InterruptOutcome::Blocked);
    }

    #[tokio::test]
    async fn no_active_pid_just_schedules_dispatch() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let task_id = new_task(&db);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = interrupt(&db, &tx, "true", &task_id, "hello", None).await.unwrap();
        assert_eq!(outcome, InterruptOutcome::Dispatched);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.task_id, task_id);
        assert!(db.has_pending(&task_id).unwrap());
    }

    #[tokio::test]
    async fn active_pid_is_killed_and_message_sent_immediately() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let task_id = new_task(&db);

        let child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        db.update_task(
            &task_id,
            &TaskPatch { process_pid: Some(Some(pid as i64)), ..Default::default() },
        )
        .unwrap();

        let (_dir, agent_path) = fake_agent(
            "#!/bin/sh\necho '{\"type\":\"result\",\"result\":\"done\",\"session_id\":\"s1\"}'\n",
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = interrupt(&db, &tx, &agent_path, &task_id, "stop and do this instead", None)
            .await
            .unwrap();
        assert_eq!(outcome, InterruptOutcome::Dispatched);
        assert!(rx.try_recv().is_ok());

        let task = db.load_task(&task_id).unwrap().unwrap();
        assert_eq!(task.process_pid, None);
        assert_eq!(task.agent_session_id.as_deref(), Some("s1"));

        let interactions = db.list_interactions(&task_id).unwrap();
        assert!(interactions
            .iter()
            .any(|i| i.interaction_type == InteractionType::UserRequest && i.content == "stop and do this instead"));
        assert!(interactions
            .iter()
            .any(|i| i.interaction_type == InteractionType::ClaudeResponse));
    }
}
