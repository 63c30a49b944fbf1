//! The Task Executor: the iteration loop that drives one task's
//! conversation with the Agent, turn by turn, to a terminal state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agent_driver::{self, RunRequest};
use crate::db::models::{InteractionType, Task, TaskPatch, TaskStatus, Usage};
use crate::db::Database;
use crate::error::{AgentDriverError, ExecutorError};
use crate::planner::{self, PlanDecision};
use crate::responder;
use crate::test_runner::TestRunner;
use crate::worktree;

const RECOVERY_CONTEXT_DEPTH: usize = 10;
const RECOVERY_CONTENT_TRUNCATE: usize = 400;

pub struct Executor {
    db: Database,
    agent_bin: String,
    criteria_checker: Arc<dyn crate::criteria::CriteriaChecker>,
    test_runner: Arc<dyn TestRunner>,
}

/// Outcome of the decision step within one iteration.
enum Decision {
    /// Keep looping: drive the next turn directly with this generated
    /// continuation text, logged as SIMULATED_HUMAN (not a real user entry).
    Continue(String),
    /// User queued more input while this turn ran; consume it next pass.
    MoreInput,
    /// Chat mode with no queued follow-up: pause for the user.
    Pause,
    /// Criteria satisfied.
    Finished(String),
    /// Auto-responder judged this complete with no explicit criteria.
    Completed(String),
}

impl Executor {
    pub fn new(
        db: Database,
        agent_bin: impl Into<String>,
        criteria_checker: Arc<dyn crate::criteria::CriteriaChecker>,
        test_runner: Arc<dyn TestRunner>,
    ) -> Self {
        Self {
            db,
            agent_bin: agent_bin.into(),
            criteria_checker,
            test_runner,
        }
    }

    fn record_interaction(
        &self,
        task_id: &str,
        kind: InteractionType,
        content: &str,
        images: Option<&[String]>,
        usage: &Usage,
    ) -> Result<(), ExecutorError> {
        self.db
            .append_interaction(task_id, kind, content, images, usage)?;
        Ok(())
    }

    fn reload(&self, task_id: &str) -> Result<Task, ExecutorError> {
        self.db
            .load_task(task_id)?
            .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()))
    }

    /// Drives one task to its next terminal (or paused) state. A no-op if
    /// another worker already owns the task or it is already terminal.
    pub async fn execute_task(&self, task_id: &str) -> Result<(), ExecutorError> {
        let mut task = self.reload(task_id)?;

        if task.status != TaskStatus::Running {
            if !self.db.try_claim_running(task_id)? {
                return Ok(());
            }
            task = self.reload(task_id)?;
        }

        let mut cwd = PathBuf::from(task.initial_cwd());

        if self.db.list_interactions(task_id)?.is_empty() {
            self.run_initial_context(&mut task, &cwd).await?;
        }

        let mut terminal: Option<(TaskStatus, String)> = None;
        let mut forced_message: Option<(String, Vec<String>)> = None;

        while task.iteration < task.end_criteria_config.max_iterations {
            task = self.reload(task_id)?;
            if task.status == TaskStatus::Stopped {
                return Ok(());
            }

            if let Some(max_tokens) = task.end_criteria_config.max_tokens {
                if task.total_tokens_used >= max_tokens {
                    self.db.update_task(
                        task_id,
                        &TaskPatch {
                            status: Some(TaskStatus::Exhausted),
                            error_message: Some(Some("max tokens exceeded".to_string())),
                            ..Default::default()
                        },
                    )?;
                    return Ok(());
                }
            }

            let acquired = match forced_message.take() {
                Some(forced) => Some(forced),
                None => self.acquire_message(task_id, &task)?,
            };
            let Some((message_text, message_images)) = acquired else {
                if task.chat_mode {
                    self.db.update_task(
                        task_id,
                        &TaskPatch { status: Some(TaskStatus::Paused), ..Default::default() },
                    )?;
                }
                break;
            };

            let plan_prompt =
                planner::build_prompt(&message_text, &task.projects, task.root_folder.as_deref());
            let plan_outcome = match self.run_agent_turn(&task, &plan_prompt, &cwd).await {
                Ok(o) => o,
                Err(_) => {
                    self.fail(task_id, "planning turn failed")?;
                    return Ok(());
                }
            };
            if task.agent_session_id.is_none() {
                if let Some(sid) = &plan_outcome.session_id {
                    task.agent_session_id = Some(sid.clone());
                    self.db.update_task(
                        task_id,
                        &TaskPatch {
                            agent_session_id: Some(Some(sid.clone())),
                            ..Default::default()
                        },
                    )?;
                }
            }

            let decision = planner::parse(&plan_outcome.text);
            let provisioned_new = self
                .provision_worktrees(task_id, &mut task, &mut cwd, decision)
                .await?;

            task = self.reload(task_id)?;
            if task.status == TaskStatus::Stopped {
                return Ok(());
            }

            let prompt = if provisioned_new {
                format!("Note: your working directory is now {}.\n\n{}", cwd.display(), message_text)
            } else {
                message_text.clone()
            };

            let exec_outcome = match self
                .run_execution_turn(task_id, &mut task, &prompt, &message_images, &cwd)
                .await
            {
                Ok(o) => o,
                Err(_) => {
                    self.fail(task_id, "agent execution turn failed")?;
                    return Ok(());
                }
            };

            task = self.reload(task_id)?;
            task.iteration += 1;
            self.db.update_task(
                task_id,
                &TaskPatch { iteration: Some(task.iteration), ..Default::default() },
            )?;

            match self.decide(task_id, &task, &exec_outcome.text).await? {
                Decision::Finished(summary) => {
                    terminal = Some((TaskStatus::Finished, summary));
                    break;
                }
                Decision::Completed(summary) => {
                    terminal = Some((TaskStatus::Completed, summary));
                    break;
                }
                Decision::Pause => {
                    self.db.update_task(
                        task_id,
                        &TaskPatch { status: Some(TaskStatus::Paused), ..Default::default() },
                    )?;
                    return Ok(());
                }
                Decision::MoreInput => continue,
                Decision::Continue(text) => {
                    forced_message = Some((text, Vec::new()));
                    continue;
                }
            }
        }

        self.finalize(task_id, &cwd, terminal).await
    }

    /// Sends the bootstrap turn: task description, numbered project list,
    /// explicit "do not act yet" instruction. Establishes `agent_session_id`.
    /// Not subject to iteration accounting.
    async fn run_initial_context(
        &self,
        task: &mut Task,
        cwd: &Path,
    ) -> Result<(), ExecutorError> {
        let prompt = initial_context_prompt(task);
        self.record_interaction(
            &task.id,
            InteractionType::SystemMessage,
            &prompt,
            None,
            &Usage::default(),
        )?;

        let outcome = self.run_agent_turn(task, &prompt, cwd).await?;
        if let Some(sid) = &outcome.session_id {
            task.agent_session_id = Some(sid.clone());
        }
        self.db.update_task(
            &task.id,
            &TaskPatch {
                agent_session_id: Some(task.agent_session_id.clone()),
                ..Default::default()
            },
        )?;
        self.record_interaction(
            &task.id,
            InteractionType::ClaudeResponse,
            &outcome.text,
            None,
            &outcome.usage,
        )?;
        Ok(())
    }

    /// Runs one read-only (planning/context) agent turn, retrying once with
    /// a cleared session if the Agent rejects the current session id.
    async fn run_agent_turn(
        &self,
        task: &Task,
        message: &str,
        cwd: &Path,
    ) -> Result<agent_driver::AgentOutcome, ExecutorError> {
        let req = RunRequest {
            agent_bin: &self.agent_bin,
            message,
            cwd,
            session_id: task.agent_session_id.as_deref(),
            images: &[],
            mcp_servers: task.mcp_servers.as_ref(),
        };
        match agent_driver::run(req, |_| {}, |_| {}).await {
            Err(AgentDriverError::SessionMissing(_)) => {
                self.db.update_task(
                    &task.id,
                    &TaskPatch { agent_session_id: Some(None), ..Default::default() },
                )?;
                let retry_req = RunRequest {
                    agent_bin: &self.agent_bin,
                    message,
                    cwd,
                    session_id: None,
                    images: &[],
                    mcp_servers: task.mcp_servers.as_ref(),
                };
                Ok(agent_driver::run(retry_req, |_| {}, |_| {}).await?)
            }
            Ok(o) => Ok(o),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquires this iteration's driving message: the first pending queue
    /// entry, or — only at iteration 0 with an empty queue — the task's own
    /// description, which bootstraps execution without requiring a caller
    /// to explicitly enqueue it (see DESIGN.md).
    fn acquire_message(
        &self,
        task_id: &str,
        task: &Task,
    ) -> Result<Option<(String, Vec<String>)>, ExecutorError> {
        if let Some(entry) = self.db.peek_pending(task_id)? {
            self.db.mark_sent(task_id, &entry.text)?;
            let images = entry.images.clone().unwrap_or_default();
            self.record_interaction(
                task_id,
                InteractionType::UserRequest,
                &entry.text,
                entry.images.as_deref(),
                &Usage::default(),
            )?;
            return Ok(Some((entry.text, images)));
        }

        if task.iteration == 0 && !task.description.trim().is_empty() {
            self.record_interaction(
                task_id,
                InteractionType::UserRequest,
                &task.description,
                None,
                &Usage::default(),
            )?;
            return Ok(Some((task.description.clone(), Vec::new())));
        }

        Ok(None)
    }

    /// Resolves the planner's decision to concrete worktree paths, creates
    /// them, and — if this is the task's first worktree — atomically clears
    /// the session and re-sends initial context in the new cwd.
    async fn provision_worktrees(
        &self,
        task_id: &str,
        task: &mut Task,
        cwd: &mut PathBuf,
        decision: PlanDecision,
    ) -> Result<bool, ExecutorError> {
        let targets: Vec<(PathBuf, Option<String>, Option<String>)> = match decision {
            PlanDecision::NoWrite => Vec::new(),
            PlanDecision::Current => {
                if let Some(wt) = &task.worktree_path {
                    *cwd = PathBuf::from(wt);
                }
                Vec::new()
            }
            PlanDecision::Targets(nums) => planner::resolve_targets(&nums, &task.projects)
                .into_iter()
                .filter(|p| p.access == crate::db::models::Access::Write)
                .map(|p| {
                    (
                        PathBuf::from(&p.path),
                        p.branch_name.clone(),
                        task.base_branch.clone().or_else(|| p.base_branch.clone()),
                    )
                })
                .collect(),
            PlanDecision::RootFolder => {
                let root = task.root_folder.clone().unwrap_or_else(|| cwd.display().to_string());
                vec![(PathBuf::from(root), task.branch_name.clone(), task.base_branch.clone())]
            }
        };

        let mut created = Vec::new();
        for (repo, branch, base) in targets {
            match worktree::create(&repo, &task.name, branch.as_deref(), base.as_deref()).await {
                Ok(path) => created.push(path),
                Err(e) if is_transient(&e) => {
                    if let Ok(path) =
                        worktree::create(&repo, &task.name, branch.as_deref(), base.as_deref()).await
                    {
                        created.push(path);
                    } else {
                        tracing::warn!("worktree create retry failed for {}: {e}", repo.display());
                    }
                }
                Err(e) => tracing::warn!("worktree create failed for {}: {e}", repo.display()),
            }
        }

        if created.is_empty() {
            return Ok(false);
        }

        if task.worktree_path.is_none() {
            let first = created[0].clone();
            let first_str = first.to_string_lossy().to_string();
            task.worktree_path = Some(first_str.clone());
            task.agent_session_id = None;
            self.db.update_task(
                task_id,
                &TaskPatch {
                    worktree_path: Some(Some(first_str)),
                    agent_session_id: Some(None),
                    ..Default::default()
                },
            )?;
            *cwd = first;
            self.run_initial_context(task, cwd).await?;

            let listing = created
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.record_interaction(
                task_id,
                InteractionType::SystemMessage,
                &format!("Worktrees provisioned: {listing}"),
                None,
                &Usage::default(),
            )?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn run_execution_turn(
        &self,
        task_id: &str,
        task: &mut Task,
        message: &str,
        images: &[String],
        cwd: &Path,
    ) -> Result<agent_driver::AgentOutcome, ExecutorError> {
        let task_id_owned = task_id.to_string();
        let db = self.db.clone();

        let req = RunRequest {
            agent_bin: &self.agent_bin,
            message,
            cwd,
            session_id: task.agent_session_id.as_deref(),
            images,
            mcp_servers: task.mcp_servers.as_ref(),
        };

        let on_event = {
            let task_id = task_id_owned.clone();
            let db = db.clone();
            move |event: crate::event_parser::ParsedEvent| {
                if let crate::event_parser::ParsedEvent::ToolResult(text) = event {
                    let _ = db.append_interaction(
                        &task_id,
                        InteractionType::ToolResult,
                        &text,
                        None,
                        &Usage::default(),
                    );
                }
            }
        };
        let on_spawn = {
            let task_id = task_id_owned.clone();
            let db = db.clone();
            move |pid: u32| {
                let _ = db.update_task(
                    &task_id,
                    &TaskPatch { process_pid: Some(Some(pid as i64)), ..Default::default() },
                );
            }
        };

        let outcome = match agent_driver::run(req, on_event, on_spawn).await {
            Err(AgentDriverError::SessionMissing(_)) => {
                self.db.update_task(
                    task_id,
                    &TaskPatch { agent_session_id: Some(None), ..Default::default() },
                )?;
                task.agent_session_id = None;
                let retry_req = RunRequest {
                    agent_bin: &self.agent_bin,
                    message,
                    cwd,
                    session_id: None,
                    images,
                    mcp_servers: task.mcp_servers.as_ref(),
                };
                let on_event = {
                    let task_id = task_id_owned.clone();
                    let db = db.clone();
                    move |event: crate::event_parser::ParsedEvent| {
                        if let crate::event_parser::ParsedEvent::ToolResult(text) = event {
                            let _ = db.append_interaction(
                                &task_id,
                                InteractionType::ToolResult,
                                &text,
                                None,
                                &Usage::default(),
                            );
                        }
                    }
                };
                let on_spawn = {
                    let task_id = task_id_owned.clone();
                    let db = db.clone();
                    move |pid: u32| {
                        let _ = db.update_task(
                            &task_id,
                            &TaskPatch { process_pid: Some(Some(pid as i64)), ..Default::default() },
                        );
                    }
                };
                agent_driver::run(retry_req, on_event, on_spawn).await.map_err(ExecutorError::from)
            }
            Ok(o) => Ok(o),
            Err(e) => Err(ExecutorError::from(e)),
        }?;

        task.agent_session_id = outcome.session_id.clone().or_else(|| task.agent_session_id.clone());
        let output_tokens = outcome.usage.output_tokens.unwrap_or(0).max(0) as u64;
        task.total_tokens_used += output_tokens;

        self.db.update_task(
            task_id,
            &TaskPatch {
                agent_session_id: Some(task.agent_session_id.clone()),
                process_pid: Some(None),
                total_tokens_used: Some(task.total_tokens_used),
                ..Default::default()
            },
        )?;
        self.record_interaction(
            task_id,
            InteractionType::ClaudeResponse,
            &outcome.text,
            None,
            &outcome.usage,
        )?;

        Ok(outcome)
    }

    async fn decide(
        &self,
        task_id: &str,
        task: &Task,
        latest_response: &str,
    ) -> Result<Decision, ExecutorError> {
        if let Some(criteria) = task.end_criteria_config.criteria.clone().filter(|c| !c.is_empty()) {
            if !task.chat_mode {
                let (done, reason) = self
                    .criteria_checker
                    .check(&criteria, &task.description, latest_response)
                    .await;
                if done {
                    return Ok(Decision::Finished(reason));
                }
            }
        }

        if self.db.has_pending(task_id)? {
            return Ok(Decision::MoreInput);
        }

        if task.chat_mode {
            return Ok(Decision::Pause);
        }

        if !responder::should_continue(latest_response, task.iteration, task.end_criteria_config.max_iterations) {
            return Ok(Decision::Completed(latest_response.to_string()));
        }

        let continuation = responder::generate_response(latest_response, task_id, task.iteration);
        self.record_interaction(
            task_id,
            InteractionType::SimulatedHuman,
            &continuation,
            None,
            &Usage::default(),
        )?;
        Ok(Decision::Continue(continuation))
    }

    fn fail(&self, task_id: &str, reason: &str) -> Result<(), ExecutorError> {
        self.db.update_task(
            task_id,
            &TaskPatch {
                status: Some(TaskStatus::Failed),
                error_message: Some(Some(reason.to_string())),
                process_pid: Some(None),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    async fn finalize(
        &self,
        task_id: &str,
        cwd: &Path,
        terminal: Option<(TaskStatus, String)>,
    ) -> Result<(), ExecutorError> {
        let mut task = self.reload(task_id)?;

        let mut final_status = terminal.as_ref().map(|(s, _)| *s);
        if final_status.is_none() {
            if task.status == TaskStatus::Running && task.iteration >= task.end_criteria_config.max_iterations {
                final_status = Some(TaskStatus::Exhausted);
            } else if task.status == TaskStatus::Paused {
                final_status = None; // already paused, nothing further to do
            }
        }

        let summary = terminal.as_ref().map(|(_, s)| s.clone()).or_else(|| task.summary.clone()).or_else(|| {
            self.db
                .list_interactions(task_id)
                .ok()?
                .into_iter()
                .rev()
                .find(|i| i.interaction_type == InteractionType::ClaudeResponse)
                .map(|i| i.content)
        });

        if let Some(status) = final_status {
            let is_success = matches!(status, TaskStatus::Finished | TaskStatus::Completed);
            let mut patch = TaskPatch {
                status: Some(status),
                summary: summary.clone().map(Some),
                ..Default::default()
            };

            if is_success && !task.chat_mode {
                let worktree_dir = task.worktree_path.as_deref().map(Path::new).unwrap_or(cwd);
                let (passed, report) = self.test_runner.run(worktree_dir).await;
                if !passed {
                    patch.status = Some(TaskStatus::Failed);
                    patch.error_message = Some(Some(format!("tests failed: {report}")));
                }
            }

            self.db.update_task(task_id, &patch)?;
        } else if summary.is_some() && task.summary.is_none() {
            self.db.update_task(
                task_id,
                &TaskPatch { summary: Some(summary), ..Default::default() },
            )?;
        }

        task = self.reload(task_id)?;
        let _ = task;
        Ok(())
    }

    /// Stops a running task: kills its child, cleans up write-access
    /// worktrees (auto-commit forced, since a stop must complete), clears
    /// `process_pid`, and sets STOPPED.
    pub async fn stop_task(&self, task_id: &str) -> Result<(), ExecutorError> {
        let task = self.reload(task_id)?;

        if let Some(pid) = task.process_pid {
            agent_driver::terminate(pid as u32).await;
        }

        for project in task.projects.iter().filter(|p| p.access == crate::db::models::Access::Write) {
            let branch = project
                .branch_name
                .clone()
                .unwrap_or_else(|| format!("task/{}", worktree::sanitize(&task.name)));
            let _ = worktree::cleanup_task_worktree_and_branch(
                Path::new(&project.path),
                &task.name,
                &branch,
                true,
            )
            .await;
        }

        self.db.update_task(
            task_id,
            &TaskPatch {
                status: Some(TaskStatus::Stopped),
                process_pid: Some(None),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Restarts a FAILED/EXHAUSTED/STOPPED task: prepends a recovery
    /// SYSTEM_MESSAGE summarizing the last interactions, clears the session,
    /// and marks it PENDING so the next `execute_task` call resumes it.
    pub async fn restart_task(&self, task_id: &str) -> Result<(), ExecutorError> {
        let task = self.reload(task_id)?;
        if !task.status.is_terminal() {
            return Err(ExecutorError::AlreadyRunning(task_id.to_string()));
        }

        let recent = self.db.last_interactions(task_id, RECOVERY_CONTEXT_DEPTH)?;
        let summary = recovery_system_message(&recent);
        self.record_interaction(
            task_id,
            InteractionType::SystemMessage,
            &summary,
            None,
            &Usage::default(),
        )?;

        self.db.update_task(
            task_id,
            &TaskPatch {
                status: Some(TaskStatus::Pending),
                agent_session_id: Some(None),
                error_message: Some(None),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Wipes the task's history and worktrees entirely and relaunches from
    /// scratch. Recreation of worktrees is lazy (next iteration's normal
    /// provisioning step), per the logged open-question resolution.
    pub async fn clear_and_restart_task(&self, task_id: &str) -> Result<(), ExecutorError> {
        let task = self.reload(task_id)?;

        for project in task.projects.iter().filter(|p| p.access == crate::db::models::Access::Write) {
            let branch = project
                .branch_name
                .clone()
                .unwrap_or_else(|| format!("task/{}", worktree::sanitize(&task.name)));
            let _ = worktree::cleanup_task_worktree_and_branch(
                Path::new(&project.path),
                &task.name,
                &branch,
                true,
            )
            .await;
        }

        self.db.delete_interactions(task_id)?;
        self.db.reset_task_for_restart(task_id)?;
        Ok(())
    }
}

fn is_transient(e: &crate::error::WorktreeError) -> bool {
    matches!(e, crate::error::WorktreeError::Timeout(_, _))
}

fn initial_context_prompt(task: &Task) -> String {
    let mut out = String::new();
    out.push_str(&format!("Task: {}\n", task.name));
    out.push_str(&format!("Description: {}\n\n", task.description));

    if task.projects.is_empty() {
        if let Some(root) = &task.root_folder {
            out.push_str(&format!("1. {root} (root folder)\n"));
        }
    } else {
        for (i, p) in task.projects.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} — {} (access: {:?}, type: {:?})\n",
                i + 1,
                p.path,
                p.context,
                p.access,
                p.project_type
            ));
        }
    }

    out.push_str(
        "\nDo not explore or read files; do not invoke tools. Acknowledge and wait for \
         instructions.",
    );
    out
}

fn recovery_system_message(recent: &[crate::db::models::Interaction]) -> String {
    let mut out = String::from("Resuming after restart. Recent context:\n");
    for i in recent {
        let mut content = i.content.clone();
        if content.len() > RECOVERY_CONTENT_TRUNCATE {
            content.truncate(RECOVERY_CONTENT_TRUNCATE);
            content.push_str("...");
        }
        out.push_str(&format!("[{}] {}\n", i.interaction_type.as_str(), content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::CriteriaChecker;
    use crate::db::queries::CreateTask;
    use crate::test_runner::ShellTestRunner;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct AlwaysDoneChecker;

    #[async_trait]
    impl CriteriaChecker for AlwaysDoneChecker {
        async fn check(&self, _c: &str, _d: &str, _r: &str) -> (bool, String) {
            (true, "criteria met".to_string())
        }
    }

    struct NeverDoneChecker;

    #[async_trait]
    impl CriteriaChecker for NeverDoneChecker {
        async fn check(&self, _c: &str, _d: &str, _r: &str) -> (bool, String) {
            (false, "not yet".to_string())
        }
    }

    fn fake_agent_script(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db
    }

    #[tokio::test]
    async fn execute_task_with_criteria_reaches_finished() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "demo".into(),
                description: "write hello.py".into(),
                end_criteria_config: crate::db::models::EndCriteriaConfig {
                    criteria: Some("hello.py exists".into()),
                    max_iterations: 5,
                    max_tokens: None,
                },
                ..Default::default()
            })
            .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let script = fake_agent_script(
            scratch.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"s1"}'
echo '{"type":"result","result":"```planning\nNEEDS_WRITE: NO\nWRITE_TARGETS: NONE\n```","usage":{"output_tokens":3}}'"#,
        );

        let executor = Executor::new(
            db.clone(),
            script.to_str().unwrap(),
            Arc::new(AlwaysDoneChecker),
            Arc::new(ShellTestRunner::new(None)),
        );

        executor.execute_task(&task.id).await.unwrap();

        let loaded = db.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Finished);
        assert!(loaded.summary.is_some());
        assert!(loaded.process_pid.is_none());
    }

    #[tokio::test]
    async fn execute_task_without_criteria_completes_via_responder() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "demo2".into(),
                description: "done already".into(),
                end_criteria_config: crate::db::models::EndCriteriaConfig {
                    criteria: None,
                    max_iterations: 5,
                    max_tokens: None,
                },
                ..Default::default()
            })
            .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let script = fake_agent_script(
            scratch.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"s1"}'
echo '{"type":"result","result":"All tests pass, the implementation is complete.","usage":{"output_tokens":3}}'"#,
        );

        let executor = Executor::new(
            db.clone(),
            script.to_str().unwrap(),
            Arc::new(NeverDoneChecker),
            Arc::new(ShellTestRunner::new(None)),
        );

        executor.execute_task(&task.id).await.unwrap();

        let loaded = db.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn chat_mode_pauses_after_one_turn_with_no_followup() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "chat".into(),
                description: "let's talk".into(),
                chat_mode: true,
                ..Default::default()
            })
            .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let script = fake_agent_script(
            scratch.path(),
            r#"echo '{"type":"result","result":"Sure, what would you like to do next?","usage":{"output_tokens":2}}'"#,
        );

        let executor = Executor::new(
            db.clone(),
            script.to_str().unwrap(),
            Arc::new(NeverDoneChecker),
            Arc::new(ShellTestRunner::new(None)),
        );

        executor.execute_task(&task.id).await.unwrap();

        let loaded = db.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn token_cap_exhausts_without_spawning() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "capped".into(),
                description: "work".into(),
                end_criteria_config: crate::db::models::EndCriteriaConfig {
                    criteria: None,
                    max_iterations: 5,
                    max_tokens: Some(1),
                },
                ..Default::default()
            })
            .unwrap();
        db.update_task(
            &task.id,
            &TaskPatch { total_tokens_used: Some(5), ..Default::default() },
        )
        .unwrap();

        let executor = Executor::new(
            db.clone(),
            "/bin/false",
            Arc::new(NeverDoneChecker),
            Arc::new(ShellTestRunner::new(None)),
        );
        executor.execute_task(&task.id).await.unwrap();

        let loaded = db.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Exhausted);
        assert!(loaded.error_message.unwrap().contains("max tokens"));
    }

    #[tokio::test]
    async fn restart_clears_session_and_prepends_recovery_message() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "restartme".into(),
                description: "work".into(),
                ..Default::default()
            })
            .unwrap();
        db.update_task(
            &task.id,
            &TaskPatch {
                status: Some(TaskStatus::Failed),
                agent_session_id: Some(Some("old-session".into())),
                ..Default::default()
            },
        )
        .unwrap();
        db.append_interaction(
            &task.id,
            InteractionType::ClaudeResponse,
            "previous attempt output",
            None,
            &Usage::default(),
        )
        .unwrap();

        let executor = Executor::new(
            db.clone(),
            "/bin/false",
            Arc::new(NeverDoneChecker),
            Arc::new(ShellTestRunner::new(None)),
        );
        executor.restart_task(&task.id).await.unwrap();

        let loaded = db.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(loaded.agent_session_id.is_none());

        let log = db.list_interactions(&task.id).unwrap();
        assert!(log.last().unwrap().content.contains("previous attempt output"));
    }
}
