//! agent-tasks entry point.

use agent_tasks::cli::serve::serve_lines;
use agent_tasks::cli::{Cli, Command};
use agent_tasks::config::{Config, ConfigLoader, StoreBackend};
use agent_tasks::coordinator::Coordinator;
use agent_tasks::db::{Database, migrations};
use agent_tasks::logging::{LogTarget, init_logging};
use agent_tasks::tools::{ToolContext, ToolHandler};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_target = LogTarget::parse(&cli.log);
    init_logging(&log_target, cli.verbose)?;

    let mut loader = match &cli.config {
        Some(path) => ConfigLoader::load_from(Path::new(path))?,
        None => ConfigLoader::load()?,
    };
    if let Some(path) = loader.config_path() {
        info!(path = %path.display(), "Loaded configuration");
    }

    // Override store settings from CLI arguments
    let config = loader.config_mut();
    if let Some(store) = &cli.store {
        config.store.path = Some(store.into());
    }
    if let Some(backend) = cli.backend {
        config.store.backend = backend.into();
    }
    let config = loader.into_config();

    match cli.command.unwrap_or(Command::Serve { agent_id: None }) {
        Command::Serve { agent_id } => {
            if log_target == LogTarget::Stdout {
                warn!("Logging to stdout interleaves with tool responses");
            }
            run_serve(&config, agent_id.as_deref()).await?;
        }
        Command::Call {
            tool,
            args,
            agent_id,
        } => {
            let args: Value = match args {
                Some(raw) => serde_json::from_str(&raw).context("tool arguments must be JSON")?,
                None => Value::Null,
            };
            let handler = ToolHandler::new(Arc::new(Coordinator::open(&config)?));
            let response = handler
                .call_tool(&ToolContext::new(agent_id), &tool, args)
                .await;
            print_json(&response)?;
        }
        Command::Tools => {
            let handler = ToolHandler::new(Arc::new(Coordinator::open(&config)?));
            print_json(&handler.get_tools())?;
        }
        Command::Agents { online_only } => {
            let coordinator = Coordinator::open(&config)?;
            let mut agents = coordinator.agents().list_agents().await?;
            if online_only {
                agents.retain(|a| a.online);
            }
            print_json(&agents)?;
        }
        Command::Sweep => {
            let coordinator = Coordinator::open(&config)?;
            print_json(&coordinator.sweeper().sweep().await?)?;
        }
        Command::Resolve => {
            let coordinator = Coordinator::open(&config)?;
            print_json(&coordinator.resolver().update_task_statuses().await?)?;
        }
        Command::Migrations => run_migrations_list(&config)?,
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Register, run the control loops and answer tool calls until stdin closes.
async fn run_serve(config: &Config, agent_id: Option<&str>) -> Result<()> {
    let coordinator = Arc::new(Coordinator::open(config)?);
    let agent = coordinator.agents().register(agent_id).await?;
    let background = coordinator.spawn_background();
    info!(
        agent_id = %agent.id,
        loops = background.len(),
        "Serving tool calls on stdin"
    );

    let handler = ToolHandler::new(Arc::clone(&coordinator));
    let ctx = ToolContext::new(agent.id.clone());
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let outcome = tokio::select! {
        result = serve_lines(&handler, &ctx, stdin, stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    background.shutdown();
    coordinator.agents().unregister().await?;
    outcome
}

fn run_migrations_list(config: &Config) -> Result<()> {
    if config.store.backend != StoreBackend::Sqlite {
        println!("The file backend has no migrations (use --backend sqlite).");
        return Ok(());
    }
    let db = Database::open(config.store.effective_path())?;
    let applied = db.with_conn(migrations::applied_migrations)?;
    print_json(&applied)
}
