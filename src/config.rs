//! Environment-derived configuration. No config-file loading — out of scope.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Name (or path) of the agent CLI binary to spawn. Defaults to `claude`.
pub fn agent_bin() -> String {
    std::env::var("TASKCORE_AGENT_BIN").unwrap_or_else(|_| "claude".to_string())
}

/// Default project root used when a task specifies neither a worktree, a
/// project list, nor a `root_folder`.
pub fn default_project_root() -> String {
    std::env::var("TASKCORE_PROJECT_ROOT").unwrap_or_else(|_| ".".to_string())
}

/// Resolves the sqlite database path, creating its parent directory.
/// `~/.taskcore/taskcore.db` by default, overridable with `TASKCORE_DB`.
pub fn db_path() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var("TASKCORE_DB") {
        return Ok(PathBuf::from(custom));
    }

    let home = dirs::home_dir().context("could not determine home directory")?;
    let dir = home.join(".taskcore");
    std::fs::create_dir_all(&dir).context("creating ~/.taskcore")?;
    Ok(dir.join("taskcore.db"))
}
