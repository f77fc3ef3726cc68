//! CLI command definitions for agent-tasks
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

pub mod serve;

use crate::config::StoreBackend;
use clap::{Parser, Subcommand, ValueEnum};

/// Store backend selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// One JSON file per record, guarded by lock files
    File,
    /// Single SQLite database
    Sqlite,
}

impl From<BackendArg> for StoreBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::File => StoreBackend::File,
            BackendArg::Sqlite => StoreBackend::Sqlite,
        }
    }
}

/// Multi-agent task coordination over a shared durable store
#[derive(Parser, Debug)]
#[command(name = "agent-tasks", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Store directory or database file (overrides config)
    #[arg(short, long, global = true)]
    pub store: Option<String>,

    /// Store backend (overrides config)
    #[arg(short, long, value_enum, global = true)]
    pub backend: Option<BackendArg>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register as an agent and serve JSON-line tool calls on stdin (default)
    Serve {
        /// Agent ID to register as (allocated if omitted)
        #[arg(long)]
        agent_id: Option<String>,
    },

    /// Invoke a single tool and print its JSON result
    Call {
        /// Tool name, e.g. create_task
        tool: String,

        /// JSON object of arguments
        args: Option<String>,

        /// Caller identity for ownership checks and history
        #[arg(long, default_value = "cli")]
        agent_id: String,
    },

    /// Print tool definitions with their input schemas
    Tools,

    /// List agents with derived liveness
    Agents {
        /// Only agents with a fresh heartbeat
        #[arg(long)]
        online_only: bool,
    },

    /// Run one recovery sweep
    Sweep,

    /// Run one dependency resolution pass
    Resolve,

    /// List applied SQLite migrations
    Migrations,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_parses_tool_and_args() {
        let cli = Cli::parse_from([
            "agent-tasks",
            "--backend",
            "sqlite",
            "call",
            "get_task",
            r#"{"task_id":"t1"}"#,
            "--agent-id",
            "agent-3",
        ]);
        assert_eq!(cli.backend, Some(BackendArg::Sqlite));
        assert_eq!(
            cli.command,
            Some(Command::Call {
                tool: "get_task".into(),
                args: Some(r#"{"task_id":"t1"}"#.into()),
                agent_id: "agent-3".into(),
            })
        );
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::parse_from(["agent-tasks"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "2");
    }
}
