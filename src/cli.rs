use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "taskcore", about = "Drive long-running code-assistant agent conversations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the backend server
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "3001")]
        port: u16,
    },
    /// Create a task and dispatch it immediately
    Create {
        /// Human-readable task name
        name: String,
        /// What the agent should do
        description: String,
        /// Project path with write access (repeatable)
        #[arg(long = "write")]
        write_projects: Vec<String>,
        /// Project path with read-only access (repeatable)
        #[arg(long = "read")]
        read_projects: Vec<String>,
        /// Keep the conversation interactive instead of auto-continuing
        #[arg(long)]
        chat_mode: bool,
        /// Natural-language end criteria, checked each iteration
        #[arg(long)]
        criteria: Option<String>,
        #[arg(long, default_value_t = 20)]
        max_iterations: u32,
        #[arg(long)]
        max_tokens: Option<u64>,
    },
    /// List all tasks
    List,
    /// Show one task's current state
    Status { task_id: String },
    /// Enqueue a message for a task (interrupts a running agent turn)
    Input { task_id: String, message: String },
    /// Stop a running task
    Stop { task_id: String },
    /// Restart a terminal task, carrying forward a recovery summary
    Restart { task_id: String },
    /// Wipe a task's history and worktrees, then relaunch from scratch
    ClearRestart { task_id: String },
}

fn api_base() -> String {
    std::env::var("TASKCORE_API").unwrap_or_else(|_| "http://localhost:3001".to_string())
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_create(
    name: String,
    description: String,
    write_projects: Vec<String>,
    read_projects: Vec<String>,
    chat_mode: bool,
    criteria: Option<String>,
    max_iterations: u32,
    max_tokens: Option<u64>,
) -> Result<()> {
    let projects: Vec<serde_json::Value> = write_projects
        .into_iter()
        .map(|path| json!({"path": path, "access": "write", "context": "", "project_type": "other"}))
        .chain(
            read_projects
                .into_iter()
                .map(|path| json!({"path": path, "access": "read", "context": "", "project_type": "other"})),
        )
        .collect();

    let body = json!({
        "name": name,
        "description": description,
        "chat_mode": chat_mode,
        "projects": projects,
        "end_criteria_config": {
            "criteria": criteria,
            "max_iterations": max_iterations,
            "max_tokens": max_tokens,
        },
    });

    let client = reqwest::Client::new();
    let resp = client.post(format!("{}/tasks", api_base())).json(&body).send().await?;
    print_response(resp).await
}

pub async fn handle_list() -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client.get(format!("{}/tasks", api_base())).send().await?;
    print_response(resp).await
}

pub async fn handle_status(task_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client.get(format!("{}/tasks/{}", api_base(), task_id)).send().await?;
    print_response(resp).await
}

pub async fn handle_input(task_id: &str, message: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/tasks/{}/input", api_base(), task_id))
        .json(&json!({"text": message}))
        .send()
        .await?;
    print_response(resp).await
}

pub async fn handle_stop(task_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client.post(format!("{}/tasks/{}/stop", api_base(), task_id)).send().await?;
    print_response(resp).await
}

pub async fn handle_restart(task_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client.post(format!("{}/tasks/{}/restart", api_base(), task_id)).send().await?;
    print_response(resp).await
}

pub async fn handle_clear_restart(task_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/tasks/{}/clear-restart", api_base(), task_id))
        .send()
        .await?;
    print_response(resp).await
}

async fn print_response(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("request failed with status {status}");
    }
    Ok(())
}
