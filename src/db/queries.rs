use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

use super::models::{
    EndCriteriaConfig, Interaction, InteractionType, ProjectEntry, QueueEntryStatus, Task,
    TaskPatch, TaskStatus, Usage, UserInputEntry,
};
use super::Database;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateTask {
    pub name: String,
    pub description: String,
    pub chat_mode: bool,
    pub projects: Vec<ProjectEntry>,
    pub root_folder: Option<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub end_criteria_config: EndCriteriaConfig,
    pub mcp_servers: Option<serde_json::Value>,
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status_str: String = row.get("status")?;
    let projects_json: String = row.get("projects")?;
    let criteria_json: String = row.get("end_criteria_config")?;
    let mcp_json: Option<String> = row.get("mcp_servers")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Task {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
        chat_mode: row.get::<_, i64>("chat_mode")? != 0,
        projects: serde_json::from_str(&projects_json).unwrap_or_default(),
        root_folder: row.get("root_folder")?,
        branch_name: row.get("branch_name")?,
        base_branch: row.get("base_branch")?,
        worktree_path: row.get("worktree_path")?,
        agent_session_id: row.get("agent_session_id")?,
        process_pid: row.get("process_pid")?,
        end_criteria_config: serde_json::from_str(&criteria_json).unwrap_or_default(),
        total_tokens_used: row.get::<_, i64>("total_tokens_used")? as u64,
        iteration: row.get::<_, i64>("iteration")? as u32,
        summary: row.get("summary")?,
        error_message: row.get("error_message")?,
        mcp_servers: mcp_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Database {
    pub fn create_task(&self, input: &CreateTask) -> Result<Task> {
        let conn = self.conn();
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let projects_json = serde_json::to_string(&input.projects)?;
        let criteria_json = serde_json::to_string(&input.end_criteria_config)?;
        let mcp_json = input
            .mcp_servers
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO tasks (
                id, name, description, status, chat_mode, projects, root_folder,
                branch_name, base_branch, end_criteria_config, mcp_servers,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, 'PENDING', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                id,
                input.name,
                input.description,
                input.chat_mode as i64,
                projects_json,
                input.root_folder,
                input.branch_name,
                input.base_branch,
                criteria_json,
                mcp_json,
                now,
            ],
        )
        .context("inserting task")?;

        self.load_task_locked(&conn, &id)?
            .context("task vanished immediately after insert")
    }

    pub fn load_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn();
        self.load_task_locked(&conn, id)
    }

    fn load_task_locked(
        &self,
        conn: &rusqlite::Connection,
        id: &str,
    ) -> Result<Option<Task>> {
        conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()
            .context("loading task")
    }

    pub fn load_task_by_name(&self, name: &str) -> Result<Option<Task>> {
        let conn = self.conn();
        conn.query_row("SELECT * FROM tasks WHERE name = ?1", params![name], row_to_task)
            .optional()
            .context("loading task by name")
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at ASC")?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Transition `PENDING|STOPPED|PAUSED -> RUNNING` via compare-and-set.
    /// Returns `true` if this call won the transition (no other worker
    /// already owns the task).
    pub fn try_claim_running(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE tasks SET status = 'RUNNING', updated_at = ?2
             WHERE id = ?1 AND status IN ('PENDING', 'STOPPED', 'PAUSED')",
            params![id, now],
        )?;
        Ok(affected == 1)
    }

    pub fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<()> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        if let Some(status) = patch.status {
            conn.execute(
                "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?;
        }
        if let Some(wp) = &patch.worktree_path {
            conn.execute(
                "UPDATE tasks SET worktree_path = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, wp, now],
            )?;
        }
        if let Some(sid) = &patch.agent_session_id {
            conn.execute(
                "UPDATE tasks SET agent_session_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, sid, now],
            )?;
        }
        if let Some(pid) = &patch.process_pid {
            conn.execute(
                "UPDATE tasks SET process_pid = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, pid, now],
            )?;
        }
        if let Some(tokens) = patch.total_tokens_used {
            conn.execute(
                "UPDATE tasks SET total_tokens_used = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, tokens as i64, now],
            )?;
        }
        if let Some(iter) = patch.iteration {
            conn.execute(
                "UPDATE tasks SET iteration = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, iter, now],
            )?;
        }
        if let Some(summary) = &patch.summary {
            conn.execute(
                "UPDATE tasks SET summary = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, summary, now],
            )?;
        }
        if let Some(err) = &patch.error_message {
            conn.execute(
                "UPDATE tasks SET error_message = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, err, now],
            )?;
        }

        Ok(())
    }

    // ── Interaction Log ──

    #[allow(clippy::too_many_arguments)]
    pub fn append_interaction(
        &self,
        task_id: &str,
        interaction_type: InteractionType,
        content: &str,
        images: Option<&[String]>,
        usage: &Usage,
    ) -> Result<Interaction> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let images_json = images.map(serde_json::to_string).transpose()?;

        conn.execute(
            "INSERT INTO interactions (
                task_id, interaction_type, content, images,
                input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                duration_ms, cost_usd, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task_id,
                interaction_type.as_str(),
                content,
                images_json,
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_creation_tokens,
                usage.cache_read_tokens,
                usage.duration_ms,
                usage.cost_usd,
                now,
            ],
        )?;

        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT * FROM interactions WHERE id = ?1",
            params![id],
            row_to_interaction,
        )
        .context("loading just-inserted interaction")
    }

    pub fn list_interactions(&self, task_id: &str) -> Result<Vec<Interaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM interactions WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![task_id], row_to_interaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn last_interactions(&self, task_id: &str, limit: usize) -> Result<Vec<Interaction>> {
        let all = self.list_interactions(task_id)?;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    // ── User-Input Queue ──

    /// Enqueues a message. Rejects as a duplicate (no queue change) if an
    /// entry with identical text was added within the last 30 seconds.
    pub fn enqueue_input(
        &self,
        task_id: &str,
        text: &str,
        images: Option<&[String]>,
    ) -> std::result::Result<UserInputEntry, crate::error::QueueError> {
        let conn = self.conn();
        let now = Utc::now();
        let window_start = (now - chrono::Duration::seconds(30)).to_rfc3339();

        let dup_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_input_queue
             WHERE task_id = ?1 AND text = ?2 AND created_at >= ?3",
            params![task_id, text, window_start],
            |row| row.get(0),
        )?;
        if dup_count > 0 {
            return Err(crate::error::QueueError::Duplicate);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let images_json = images.map(serde_json::to_string).transpose()?;
        let now_str = now.to_rfc3339();

        conn.execute(
            "INSERT INTO user_input_queue (id, task_id, text, images, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, task_id, text, images_json, now_str],
        )?;

        Ok(UserInputEntry {
            id,
            text: text.to_string(),
            images: images.map(|v| v.to_vec()),
            status: QueueEntryStatus::Pending,
            created_at: now,
            sent_at: None,
        })
    }

    pub fn peek_pending(&self, task_id: &str) -> Result<Option<UserInputEntry>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM user_input_queue
             WHERE task_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC, rowid ASC LIMIT 1",
            params![task_id],
            row_to_queue_entry,
        )
        .optional()
        .context("peeking pending input")
    }

    /// Transitions the first pending entry matching `text` to `sent`.
    /// Idempotent: a second call with no matching pending entry is a no-op.
    pub fn mark_sent(&self, task_id: &str, text: &str) -> Result<()> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM user_input_queue
                 WHERE task_id = ?1 AND text = ?2 AND status = 'pending'
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                params![task_id, text],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = id {
            conn.execute(
                "UPDATE user_input_queue SET status = 'sent', sent_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
        }
        Ok(())
    }

    pub fn has_pending(&self, task_id: &str) -> Result<bool> {
        Ok(self.peek_pending(task_id)?.is_some())
    }

    pub fn queue_status(&self, task_id: &str) -> Result<(i64, i64, Vec<UserInputEntry>)> {
        let conn = self.conn();
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_input_queue WHERE task_id = ?1 AND status = 'pending'",
            params![task_id],
            |row| row.get(0),
        )?;
        let sent: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_input_queue WHERE task_id = ?1 AND status = 'sent'",
            params![task_id],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT * FROM user_input_queue WHERE task_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 5",
        )?;
        let preview = stmt
            .query_map(params![task_id], row_to_queue_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((pending, sent, preview))
    }

    /// Drops `sent` entries older than `retain`, for long-lived tasks.
    pub fn compact_queue(&self, task_id: &str, retain: chrono::Duration) -> Result<u64> {
        let conn = self.conn();
        let cutoff = (Utc::now() - retain).to_rfc3339();
        let affected = conn.execute(
            "DELETE FROM user_input_queue
             WHERE task_id = ?1 AND status = 'sent' AND sent_at < ?2",
            params![task_id, cutoff],
        )?;
        Ok(affected as u64)
    }

    // ── Restart / clear-and-restart support ──

    pub fn delete_interactions(&self, task_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM interactions WHERE task_id = ?1", params![task_id])?;
        Ok(())
    }

    /// Zeroes tokens/iteration/session/worktree and returns the task to
    /// PENDING, ready for a clean `execute_task` invocation.
    pub fn reset_task_for_restart(&self, task_id: &str) -> Result<()> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE tasks SET
                status = 'PENDING',
                agent_session_id = NULL,
                worktree_path = NULL,
                process_pid = NULL,
                total_tokens_used = 0,
                iteration = 0,
                summary = NULL,
                error_message = NULL,
                updated_at = ?2
             WHERE id = ?1",
            params![task_id, now],
        )?;
        Ok(())
    }
}

fn row_to_interaction(row: &rusqlite::Row) -> rusqlite::Result<Interaction> {
    let type_str: String = row.get("interaction_type")?;
    let images_json: Option<String> = row.get("images")?;
    let created_at: String = row.get("created_at")?;

    Ok(Interaction {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        interaction_type: InteractionType::parse(&type_str).unwrap_or(InteractionType::SystemMessage),
        content: row.get("content")?,
        images: images_json.and_then(|s| serde_json::from_str(&s).ok()),
        usage: Usage {
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            cache_creation_tokens: row.get("cache_creation_tokens")?,
            cache_read_tokens: row.get("cache_read_tokens")?,
            duration_ms: row.get("duration_ms")?,
            cost_usd: row.get("cost_usd")?,
        },
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_queue_entry(row: &rusqlite::Row) -> rusqlite::Result<UserInputEntry> {
    let status_str: String = row.get("status")?;
    let images_json: Option<String> = row.get("images")?;
    let created_at: String = row.get("created_at")?;
    let sent_at: Option<String> = row.get("sent_at")?;

    Ok(UserInputEntry {
        id: row.get("id")?,
        text: row.get("text")?,
        images: images_json.and_then(|s| serde_json::from_str(&s).ok()),
        status: if status_str == "sent" {
            QueueEntryStatus::Sent
        } else {
            QueueEntryStatus::Pending
        },
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        sent_at: sent_at.and_then(|s| s.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db
    }

    #[test]
    fn create_and_load_task_round_trips_defaults() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "demo".into(),
                description: "write hello.py".into(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.end_criteria_config.max_iterations, 20);
        assert!(task.worktree_path.is_none());

        let loaded = db.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.name, "demo");
    }

    #[test]
    fn try_claim_running_is_a_single_winner_cas() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "t".into(),
                description: "d".into(),
                ..Default::default()
            })
            .unwrap();

        assert!(db.try_claim_running(&task.id).unwrap());
        // Already RUNNING: a second claim attempt must not re-affect it.
        assert!(!db.try_claim_running(&task.id).unwrap());
    }

    #[test]
    fn enqueue_rejects_duplicate_within_window() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "t".into(),
                description: "d".into(),
                ..Default::default()
            })
            .unwrap();

        let first = db.enqueue_input(&task.id, "retry", None);
        assert!(first.is_ok());
        let second = db.enqueue_input(&task.id, "retry", None);
        assert!(matches!(second, Err(crate::error::QueueError::Duplicate)));

        let (pending, _, _) = db.queue_status(&task.id).unwrap();
        assert_eq!(pending, 1);
    }

    #[test]
    fn mark_sent_is_idempotent() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "t".into(),
                description: "d".into(),
                ..Default::default()
            })
            .unwrap();
        db.enqueue_input(&task.id, "hello", None).unwrap();

        db.mark_sent(&task.id, "hello").unwrap();
        assert!(db.peek_pending(&task.id).unwrap().is_none());

        // Second call: no pending entry left, must be a no-op (not an error).
        db.mark_sent(&task.id, "hello").unwrap();
    }

    #[test]
    fn peek_pending_returns_first_in_fifo_order() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "t".into(),
                description: "d".into(),
                ..Default::default()
            })
            .unwrap();
        db.enqueue_input(&task.id, "first", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.enqueue_input(&task.id, "second", None).unwrap();

        let peeked = db.peek_pending(&task.id).unwrap().unwrap();
        assert_eq!(peeked.text, "first");
    }

    #[test]
    fn append_and_list_interactions_preserve_order() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "t".into(),
                description: "d".into(),
                ..Default::default()
            })
            .unwrap();

        db.append_interaction(
            &task.id,
            InteractionType::UserRequest,
            "hi",
            None,
            &Usage::default(),
        )
        .unwrap();
        db.append_interaction(
            &task.id,
            InteractionType::ClaudeResponse,
            "hello back",
            None,
            &Usage::default(),
        )
        .unwrap();

        let log = db.list_interactions(&task.id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].interaction_type, InteractionType::UserRequest);
        assert_eq!(log[1].interaction_type, InteractionType::ClaudeResponse);
    }

    #[test]
    fn update_task_patch_only_touches_given_fields() {
        let db = test_db();
        let task = db
            .create_task(&CreateTask {
                name: "t".into(),
                description: "d".into(),
                ..Default::default()
            })
            .unwrap();

        db.update_task(
            &task.id,
            &TaskPatch {
                total_tokens_used: Some(42),
                ..Default::default()
            },
        )
        .unwrap();

        let loaded = db.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.total_tokens_used, 42);
        assert_eq!(loaded.status, TaskStatus::Pending);
    }
}
