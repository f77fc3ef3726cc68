//! Multi-agent task coordination over a shared durable store.
//!
//! Independent agent processes share no memory; they coordinate only through a
//! [`store::Store`] whose conditional write guarantees that at most one of
//! several racing writers wins. On top of it:
//!
//! - [`tasks::TaskStore`] mutates tasks with optimistic concurrency,
//! - [`tasks::DependencyResolver`] gates tasks on their prerequisites,
//! - [`agents::AgentRegistry`] tracks liveness through heartbeats,
//! - [`recovery::RecoverySweeper`] returns tasks held by dead agents to the pool.
//!
//! [`coordinator::Coordinator`] wires them together and [`tools::ToolHandler`]
//! exposes them as JSON tools.

pub mod agents;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod history;
pub mod logging;
pub mod recovery;
pub mod store;
pub mod tasks;
pub mod tools;
pub mod types;
