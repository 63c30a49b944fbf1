use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Testing,
    Completed,
    Failed,
    Finished,
    Exhausted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Testing => "TESTING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Finished => "FINISHED",
            TaskStatus::Exhausted => "EXHAUSTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => TaskStatus::Pending,
            "RUNNING" => TaskStatus::Running,
            "PAUSED" => TaskStatus::Paused,
            "STOPPED" => TaskStatus::Stopped,
            "TESTING" => TaskStatus::Testing,
            "COMPLETED" => TaskStatus::Completed,
            "FAILED" => TaskStatus::Failed,
            "FINISHED" => TaskStatus::Finished,
            "EXHAUSTED" => TaskStatus::Exhausted,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Finished
                | TaskStatus::Exhausted
                | TaskStatus::Stopped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Rpc,
    Web,
    Idl,
    Sdk,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub path: String,
    pub access: Access,
    pub context: String,
    pub project_type: ProjectType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndCriteriaConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

fn default_max_iterations() -> u32 {
    20
}

impl Default for EndCriteriaConfig {
    fn default() -> Self {
        Self {
            criteria: None,
            max_iterations: default_max_iterations(),
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Pending,
    Sent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputEntry {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    pub status: QueueEntryStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub chat_mode: bool,
    pub projects: Vec<ProjectEntry>,
    pub root_folder: Option<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub worktree_path: Option<String>,
    pub agent_session_id: Option<String>,
    pub process_pid: Option<i64>,
    pub end_criteria_config: EndCriteriaConfig,
    pub total_tokens_used: u64,
    pub iteration: u32,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub mcp_servers: Option<serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    /// Initial cwd policy (§4.H): first existing of worktree_path,
    /// projects[0].path, root_folder, ".".
    pub fn initial_cwd(&self) -> String {
        if let Some(p) = &self.worktree_path {
            return p.clone();
        }
        if let Some(first) = self.projects.first() {
            return first.path.clone();
        }
        if let Some(r) = &self.root_folder {
            return r.clone();
        }
        crate::config::default_project_root()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    UserRequest,
    SystemMessage,
    ClaudeResponse,
    ToolResult,
    SimulatedHuman,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::UserRequest => "user_request",
            InteractionType::SystemMessage => "system_message",
            InteractionType::ClaudeResponse => "claude_response",
            InteractionType::ToolResult => "tool_result",
            InteractionType::SimulatedHuman => "simulated_human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user_request" => InteractionType::UserRequest,
            "system_message" => InteractionType::SystemMessage,
            "claude_response" => InteractionType::ClaudeResponse,
            "tool_result" => InteractionType::ToolResult,
            "simulated_human" => InteractionType::SimulatedHuman,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: i64,
    pub task_id: String,
    pub interaction_type: InteractionType,
    pub content: String,
    pub images: Option<Vec<String>>,
    pub usage: Usage,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Fields the executor may patch on a task. `None` leaves a field
/// untouched; the repository layer only writes columns that are `Some`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub worktree_path: Option<Option<String>>,
    pub agent_session_id: Option<Option<String>>,
    pub process_pid: Option<Option<i64>>,
    pub total_tokens_used: Option<u64>,
    pub iteration: Option<u32>,
    pub summary: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
}
