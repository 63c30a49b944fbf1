//! Opaque post-success hook. Invoked once, after a task reaches a non-chat
//! terminal success, against the task's worktree (or initial cwd if none).

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, worktree_path: &Path) -> (bool, String);
}

/// Runs an optional shell command in `worktree_path`. With no command
/// configured, every call reports success — tasks that don't carry a
/// `test_command` are not held to a test requirement.
pub struct ShellTestRunner {
    pub command: Option<String>,
}

impl ShellTestRunner {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run(&self, worktree_path: &Path) -> (bool, String) {
        let Some(command) = &self.command else {
            return (true, "no test command configured".to_string());
        };

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(worktree_path)
            .output()
            .await;

        match output {
            Ok(out) => {
                let mut report = String::from_utf8_lossy(&out.stdout).into_owned();
                report.push_str(&String::from_utf8_lossy(&out.stderr));
                (out.status.success(), report)
            }
            Err(e) => (false, format!("failed to spawn test command: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_command_configured_reports_success() {
        let runner = ShellTestRunner::new(None);
        let (ok, _) = runner.run(Path::new(".")).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn passing_command_reports_success() {
        let runner = ShellTestRunner::new(Some("exit 0".to_string()));
        let (ok, _) = runner.run(Path::new(".")).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn failing_command_reports_failure_with_output() {
        let runner = ShellTestRunner::new(Some("echo broken 1>&2; exit 1".to_string()));
        let (ok, report) = runner.run(Path::new(".")).await;
        assert!(!ok);
        assert!(report.contains("broken"));
    }
}
