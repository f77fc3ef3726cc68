//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::merge::deep_merge_all;
use super::types::{Config, StoreBackend};
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Explicit config file; skips the project and user tiers.
pub const ENV_CONFIG_PATH: &str = "AGENT_TASKS_CONFIG_PATH";
/// Overrides `store.path`.
pub const ENV_STORE_PATH: &str = "AGENT_TASKS_STORE_PATH";
/// Overrides `store.backend` (`file` or `sqlite`).
pub const ENV_BACKEND: &str = "AGENT_TASKS_BACKEND";

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Embedded defaults (lowest priority)
    Defaults = 0,
    /// Project-level config ($CWD/agent-tasks/)
    Project = 1,
    /// User-level config (~/.agent-tasks/)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Paths for each configuration tier.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
    /// A single file that replaces the project and user tiers.
    pub explicit_file: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// `./agent-tasks` and `~/.agent-tasks`, or the file named by
    /// `AGENT_TASKS_CONFIG_PATH`.
    pub fn discover() -> Self {
        Self {
            project_dir: Some(PathBuf::from("agent-tasks")),
            user_dir: dirs::home_dir().map(|h| h.join(".agent-tasks")),
            explicit_file: std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from),
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
            explicit_file: None,
        }
    }
}

/// Read a YAML tier file. Unreadable or malformed files are skipped with a warning.
fn read_tier(path: &Path, tier: ConfigTier) -> Option<Value> {
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), %tier, error = %e, "Skipping unreadable config file");
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), %tier, error = %e, "Skipping malformed config file");
            None
        }
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Highest-priority config file that contributed, if any.
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load defaults plus the single file at `path`, then env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_with_paths(ConfigPaths {
            explicit_file: Some(path.to_path_buf()),
            ..ConfigPaths::discover()
        })
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        let mut configs: Vec<Value> = vec![serde_json::to_value(Config::default())?];
        let mut config_path = None;

        if let Some(path) = paths.explicit_file.clone() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let value: Value = serde_yaml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            configs.push(value);
            config_path = Some(path);
        } else {
            let tiers = [
                (paths.project_dir.as_ref(), ConfigTier::Project),
                (paths.user_dir.as_ref(), ConfigTier::User),
            ];
            for (dir, tier) in tiers {
                let Some(dir) = dir else { continue };
                let file = dir.join("config.yaml");
                if let Some(value) = read_tier(&file, tier) {
                    configs.push(value);
                    config_path = Some(file);
                }
            }
        }

        let merged = deep_merge_all(configs);
        let mut config: Config = serde_json::from_value(merged)?;
        Self::apply_env_overrides(&mut config);

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    /// Apply environment variable overrides to config.
    fn apply_env_overrides(config: &mut Config) {
        if let Ok(path) = std::env::var(ENV_STORE_PATH) {
            config.store.path = Some(PathBuf::from(path));
        }

        if let Ok(backend) = std::env::var(ENV_BACKEND) {
            match StoreBackend::parse(&backend) {
                Some(backend) => config.store.backend = backend,
                None => warn!(value = %backend, "Ignoring unknown {}", ENV_BACKEND),
            }
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to the configuration.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Get the config file path that was used.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}
