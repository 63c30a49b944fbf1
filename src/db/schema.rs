use anyhow::Result;
use rusqlite::Connection;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            chat_mode INTEGER NOT NULL DEFAULT 0,
            projects TEXT NOT NULL DEFAULT '[]',
            root_folder TEXT,
            branch_name TEXT,
            base_branch TEXT,
            worktree_path TEXT,
            agent_session_id TEXT,
            process_pid INTEGER,
            end_criteria_config TEXT NOT NULL DEFAULT '{\"max_iterations\":20}',
            total_tokens_used INTEGER NOT NULL DEFAULT 0,
            iteration INTEGER NOT NULL DEFAULT 0,
            summary TEXT,
            error_message TEXT,
            mcp_servers TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            interaction_type TEXT NOT NULL,
            content TEXT NOT NULL,
            images TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            cache_creation_tokens INTEGER,
            cache_read_tokens INTEGER,
            duration_ms INTEGER,
            cost_usd REAL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_input_queue (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            text TEXT NOT NULL,
            images TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            sent_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_interactions_task ON interactions(task_id);
        CREATE INDEX IF NOT EXISTS idx_queue_task_status ON user_input_queue(task_id, status);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        ",
    )?;

    let task_info: Vec<String> = conn
        .prepare("PRAGMA table_info(tasks)")?
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if !task_info.contains(&"iteration".to_string()) {
        conn.execute("ALTER TABLE tasks ADD COLUMN iteration INTEGER NOT NULL DEFAULT 0", [])?;
    }

    Ok(())
}
