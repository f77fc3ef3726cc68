//! Configuration types and structures.

use crate::agents::AgentRegistryOptions;
use crate::store::file::FileStoreOptions;
use crate::tasks::ClaimRetryPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which durable store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// One JSON file per key with lock files (default)
    #[default]
    File,
    /// Single SQLite database
    Sqlite,
}

impl StoreBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "files" => Some(StoreBackend::File),
            "sqlite" | "db" => Some(StoreBackend::Sqlite),
            _ => None,
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Store location: a directory for `file`, a database file for `sqlite`.
    /// Defaults to `agent-tasks/store` or `agent-tasks/tasks.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Interval of the cross-process watch poller (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up on a flat-file key lock after this long (default: 5000).
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Break flat-file locks older than this (default: 30000).
    #[serde(default = "default_stale_lock_ms")]
    pub stale_lock_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stale_lock_ms: default_stale_lock_ms(),
        }
    }
}

impl StoreConfig {
    pub fn effective_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(path), _) => path.clone(),
            (None, StoreBackend::File) => PathBuf::from("agent-tasks/store"),
            (None, StoreBackend::Sqlite) => PathBuf::from("agent-tasks/tasks.db"),
        }
    }

    pub fn file_options(&self) -> FileStoreOptions {
        FileStoreOptions {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            stale_lock: Duration::from_millis(self.stale_lock_ms),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_stale_lock_ms() -> u64 {
    30_000
}

/// Agent liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat age at which an agent counts as offline (default: 10000).
    #[serde(default = "default_offline_threshold_ms")]
    pub offline_threshold_ms: i64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            offline_threshold_ms: default_offline_threshold_ms(),
        }
    }
}

impl AgentsConfig {
    pub fn registry_options(&self) -> AgentRegistryOptions {
        AgentRegistryOptions {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            offline_threshold_ms: self.offline_threshold_ms,
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_offline_threshold_ms() -> i64 {
    10_000
}

/// Retry discipline for lost CAS races.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles per attempt (default: 100).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl ClaimsConfig {
    pub fn retry_policy(&self) -> ClaimRetryPolicy {
        ClaimRetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

/// Recovery sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_recovery_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_recovery_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_recovery_interval_ms() -> u64 {
    30_000
}

/// Periodic dependency resolution. `interval_ms: 0` disables the timer;
/// resolution still runs after creates and completions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_resolver_interval_ms(),
        }
    }
}

fn default_resolver_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

fn default_max_entries() -> usize {
    crate::history::DEFAULT_MAX_ENTRIES
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub claims: ClaimsConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
