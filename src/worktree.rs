//! Git worktree lifecycle: one worktree per (base repo, task) pair under
//! `<base_repo>/.claude_worktrees/<sanitized task name>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::WorktreeError;

const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const WORKTREE_DIR: &str = ".claude_worktrees";

#[derive(Debug, Clone)]
pub struct WorktreeRecord {
    pub path: PathBuf,
    pub branch: String,
    pub commit: String,
}

/// Replace everything but alphanumerics/`-`/`_` with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn default_branch_name(task_name: &str) -> String {
    format!("task/{}", sanitize(task_name))
}

async fn run_git(repo: &Path, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
    let fut = Command::new("git").args(args).current_dir(repo).output();
    match timeout(GIT_TIMEOUT, fut).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(e)) => Err(WorktreeError::Io(e)),
        Err(_) => Err(WorktreeError::Timeout(args.join(" "), GIT_TIMEOUT)),
    }
}

async fn is_git_repo(repo: &Path) -> bool {
    run_git(repo, &["rev-parse", "--git-dir"])
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn current_branch(repo: &Path) -> Option<String> {
    let out = run_git(repo, &["symbolic-ref", "--short", "HEAD"]).await.ok()?;
    if !out.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Returns the worktree path a branch is already checked out in, if any.
async fn find_branch_checkout(repo: &Path, branch: &str) -> Result<Option<PathBuf>, WorktreeError> {
    for wt in list(repo).await? {
        if wt.branch == branch {
            return Ok(Some(wt.path));
        }
    }
    Ok(None)
}

/// Create (or reuse) a worktree for `task_name`. Returns the worktree path.
pub async fn create(
    repo: &Path,
    task_name: &str,
    branch_name: Option<&str>,
    base_branch: Option<&str>,
) -> Result<PathBuf, WorktreeError> {
    if !is_git_repo(repo).await {
        return Err(WorktreeError::NotAGitRepo(repo.display().to_string()));
    }

    let target = repo.join(WORKTREE_DIR).join(sanitize(task_name));
    let registered = list(repo).await?;

    if target.exists() {
        if registered.iter().any(|w| w.path == target) {
            return Ok(target);
        }
        // Not a registered worktree: stale directory, clear it before retrying.
        tokio::fs::remove_dir_all(&target).await.ok();
    }

    let branch = branch_name
        .map(str::to_string)
        .unwrap_or_else(|| default_branch_name(task_name));

    if let Some(existing) = find_branch_checkout(repo, &branch).await? {
        return Ok(existing);
    }

    let base = match base_branch {
        Some(b) => b.to_string(),
        None => current_branch(repo).await.unwrap_or_else(|| "main".to_string()),
    };

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let target_str = target.to_string_lossy().to_string();

    let out = run_git(
        repo,
        &["worktree", "add", "-b", &branch, &target_str, &base],
    )
    .await?;

    if !out.status.success() {
        // Branch likely already exists without a checkout; attach to it instead.
        let out2 = run_git(repo, &["worktree", "add", &target_str, &branch]).await?;
        if !out2.status.success() {
            let stderr = String::from_utf8_lossy(&out2.stderr).trim().to_string();
            return Err(WorktreeError::GitFailed(stderr));
        }
    }

    Ok(target)
}

/// Create worktrees for every write-access, non-IDL project. Read-access and
/// IDL projects map to their own path unchanged.
pub async fn create_multi(
    task_name: &str,
    projects: &[crate::db::models::ProjectEntry],
    base_branch: Option<&str>,
) -> Result<Vec<(String, PathBuf)>, WorktreeError> {
    use crate::db::models::{Access, ProjectType};

    let mut out = Vec::with_capacity(projects.len());
    for p in projects {
        if p.access != Access::Write || p.project_type == ProjectType::Idl {
            out.push((p.path.clone(), PathBuf::from(&p.path)));
            continue;
        }
        let repo = Path::new(&p.path);
        if !is_git_repo(repo).await {
            out.push((p.path.clone(), PathBuf::from(&p.path)));
            continue;
        }
        let branch = p.branch_name.as_deref();
        let base = base_branch.or(p.base_branch.as_deref());
        let wt = create(repo, task_name, branch, base).await?;
        out.push((p.path.clone(), wt));
    }
    Ok(out)
}

async fn auto_commit_dirty(worktree: &Path, task_name: &str) -> Result<(), WorktreeError> {
    let status = run_git(worktree, &["status", "--porcelain"]).await?;
    if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
        return Ok(());
    }

    run_git(worktree, &["add", "-A"]).await?;
    let msg = format!("Auto-commit before worktree cleanup for task: {task_name}");
    let out = run_git(worktree, &["commit", "-m", &msg]).await?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(WorktreeError::DirtyCommitFailed(stderr));
    }
    Ok(())
}

/// Remove the worktree for `task_name`. Auto-commits dirty state first;
/// refuses if that commit fails and `force` is false. A missing worktree is
/// treated as success.
pub async fn remove(repo: &Path, task_name: &str, force: bool) -> Result<(), WorktreeError> {
    let target = repo.join(WORKTREE_DIR).join(sanitize(task_name));
    if !target.exists() {
        return Ok(());
    }

    match auto_commit_dirty(&target, task_name).await {
        Ok(()) => {}
        Err(e) if force => tracing::warn!("auto-commit before remove failed, forcing: {e}"),
        Err(e) => return Err(e),
    }

    let target_str = target.to_string_lossy().to_string();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&target_str);
    let out = run_git(repo, &args).await?;

    if !out.status.success() {
        tokio::fs::remove_dir_all(&target).await.ok();
        run_git(repo, &["worktree", "prune"]).await.ok();
    }

    Ok(())
}

pub async fn delete_branch(repo: &Path, branch: &str, force: bool) -> Result<(), WorktreeError> {
    let flag = if force { "-D" } else { "-d" };
    let out = run_git(repo, &["branch", flag, branch]).await?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("not found") {
            return Ok(());
        }
        tracing::warn!("branch delete failed for {branch}: {}", stderr.trim());
    }
    Ok(())
}

pub async fn cleanup_task_worktree_and_branch(
    repo: &Path,
    task_name: &str,
    branch: &str,
    force: bool,
) -> Result<(), WorktreeError> {
    remove(repo, task_name, force).await?;
    delete_branch(repo, branch, force).await?;
    Ok(())
}

pub async fn list(repo: &Path) -> Result<Vec<WorktreeRecord>, WorktreeError> {
    let out = run_git(repo, &["worktree", "list", "--porcelain"]).await?;
    let stdout = String::from_utf8_lossy(&out.stdout);

    let mut records = Vec::new();
    let (mut path, mut branch, mut commit) = (None, String::new(), String::new());

    for line in stdout.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let Some(prev) = path.take() {
                records.push(WorktreeRecord {
                    path: prev,
                    branch: std::mem::take(&mut branch),
                    commit: std::mem::take(&mut commit),
                });
            }
            path = Some(PathBuf::from(p));
        } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
            branch = b.to_string();
        } else if let Some(c) = line.strip_prefix("HEAD ") {
            commit = c.to_string();
        }
    }
    if let Some(prev) = path {
        records.push(WorktreeRecord { path: prev, branch, commit });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q", "-b", "main"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "test"]);
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[test]
    fn sanitize_replaces_disallowed_chars() {
        assert_eq!(sanitize("my task! #1"), "my_task___1");
    }

    #[tokio::test]
    async fn create_then_remove_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        let wt = create(tmp.path(), "demo task", None, None).await.unwrap();
        assert!(wt.exists());
        assert!(list(tmp.path()).await.unwrap().iter().any(|w| w.path == wt));

        remove(tmp.path(), "demo task", false).await.unwrap();
        assert!(!wt.exists());
        assert!(!list(tmp.path()).await.unwrap().iter().any(|w| w.path == wt));
    }

    #[tokio::test]
    async fn create_is_idempotent_when_already_registered() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        let first = create(tmp.path(), "demo", None, None).await.unwrap();
        let second = create(tmp.path(), "demo", None, None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn remove_on_missing_worktree_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        remove(tmp.path(), "never-created", false).await.unwrap();
    }

    #[tokio::test]
    async fn remove_auto_commits_dirty_state() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        let wt = create(tmp.path(), "demo", None, None).await.unwrap();

        std::fs::write(wt.join("new.txt"), "uncommitted").unwrap();

        let before = StdCommand::new("git")
            .args(["rev-list", "--count", "HEAD"])
            .current_dir(&wt)
            .output()
            .unwrap();
        let before_count: u32 = String::from_utf8_lossy(&before.stdout).trim().parse().unwrap();

        // Worktree is removed by this call, so inspect commit count on the branch
        // from the base repo afterward.
        remove(tmp.path(), "demo", false).await.unwrap();

        let after = StdCommand::new("git")
            .args(["rev-list", "--count", "task/demo"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        let after_count: u32 = String::from_utf8_lossy(&after.stdout).trim().parse().unwrap();

        assert!(after_count >= before_count);
    }

    #[tokio::test]
    async fn create_on_non_git_dir_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = create(tmp.path(), "demo", None, None).await.unwrap_err();
        assert!(matches!(err, WorktreeError::NotAGitRepo(_)));
    }
}
