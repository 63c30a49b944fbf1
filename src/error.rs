//! Typed errors at the seams that calling code needs to match on.
//!
//! Most internal plumbing uses `anyhow::Result` the way the donor codebase
//! does; these enums exist where a caller needs to distinguish recoverable
//! outcomes from terminal ones instead of matching on string content.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("{0} is not a git repository")]
    NotAGitRepo(String),
    #[error("worktree is dirty and auto-commit failed: {0}")]
    DirtyCommitFailed(String),
    #[error("git {0} timed out after {1:?}")]
    Timeout(String, std::time::Duration),
    #[error("git command failed: {0}")]
    GitFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("duplicate input within dedup window")]
    Duplicate,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AgentDriverError {
    #[error("agent process exited with status {0}: {1}")]
    Fatal(i32, String),
    #[error("agent session not found: {0}")]
    SessionMissing(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("task {0} already has an active worker")]
    AlreadyRunning(String),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Agent(#[from] AgentDriverError),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
