//! Unified configuration system.
//!
//! Consolidates configuration from tiers with field-by-field YAML merging:
//! 1. **Defaults** - compiled in
//! 2. **Project** - `$CWD/agent-tasks/config.yaml`
//! 3. **User** - `~/.agent-tasks/config.yaml`
//! 4. **Environment** - variables below
//!
//! ## Environment Variables
//! - `AGENT_TASKS_CONFIG_PATH` - Explicit config file (replaces project and user tiers)
//! - `AGENT_TASKS_STORE_PATH` - Store directory or database file
//! - `AGENT_TASKS_BACKEND` - `file` or `sqlite`

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier, ENV_BACKEND, ENV_CONFIG_PATH, ENV_STORE_PATH};
pub use merge::deep_merge;
pub use types::*;
