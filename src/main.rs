use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskcore::cli::{Cli, Commands};
use taskcore::criteria::AgentCriteriaChecker;
use taskcore::db::Database;
use taskcore::executor::Executor;
use taskcore::interrupt::DispatchMessage;
use taskcore::server::{self, AppState};
use taskcore::test_runner::ShellTestRunner;
use taskcore::{cli, config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskcore=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { port } => {
            let (state, dispatch_rx) = init_app_state()?;
            server::run(state, port, dispatch_rx).await?;
        }
        Commands::Create {
            name,
            description,
            write_projects,
            read_projects,
            chat_mode,
            criteria,
            max_iterations,
            max_tokens,
        } => {
            cli::handle_create(
                name,
                description,
                write_projects,
                read_projects,
                chat_mode,
                criteria,
                max_iterations,
                max_tokens,
            )
            .await?;
        }
        Commands::List => cli::handle_list().await?,
        Commands::Status { task_id } => cli::handle_status(&task_id).await?,
        Commands::Input { task_id, message } => cli::handle_input(&task_id, &message).await?,
        Commands::Stop { task_id } => cli::handle_stop(&task_id).await?,
        Commands::Restart { task_id } => cli::handle_restart(&task_id).await?,
        Commands::ClearRestart { task_id } => cli::handle_clear_restart(&task_id).await?,
    }

    Ok(())
}

fn init_app_state() -> Result<(Arc<AppState>, tokio::sync::mpsc::UnboundedReceiver<DispatchMessage>)> {
    let path = config::db_path()?;
    tracing::info!("using database at {}", path.display());
    let db = Database::open(&path)?;
    db.run_migrations()?;

    let agent_bin = config::agent_bin();
    let criteria_checker = Arc::new(AgentCriteriaChecker::new(agent_bin.clone()));
    let test_runner = Arc::new(ShellTestRunner::new(None));
    let executor = Arc::new(Executor::new(db.clone(), agent_bin.clone(), criteria_checker, test_runner));

    let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::unbounded_channel();

    Ok((
        Arc::new(AppState { db, executor, dispatch_tx, agent_bin }),
        dispatch_rx,
    ))
}
