//! Durable key-value store shared by every agent process.
//!
//! Values are JSON documents. A document's optimistic-concurrency token is its
//! top-level `version` field (absent means 0). Writers of shared keys must go
//! through [`Store::write_if_version`]; plain [`Store::write`] is for keys with a
//! single owner.

pub mod file;
pub mod sqlite;
pub mod watch;

pub use file::FileStore;
pub use sqlite::SqliteStore;
pub use watch::{WatchCallback, WatchHandle, WatchHub};

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Prefix of task records.
pub const TASK_PREFIX: &str = "tasks/";
/// Prefix of agent records.
pub const AGENT_PREFIX: &str = "agents/";
/// Prefix of per-registry bookkeeping records (counters, change markers).
pub const META_PREFIX: &str = "meta/";
/// Prefix of single-owner execution history logs.
pub const HISTORY_PREFIX: &str = "history/";

pub fn task_key(task_id: &str) -> String {
    format!("{}{}", TASK_PREFIX, task_id)
}

pub fn agent_key(agent_id: &str) -> String {
    format!("{}{}", AGENT_PREFIX, agent_id)
}

pub fn meta_key(kind: &str) -> String {
    format!("{}{}", META_PREFIX, kind)
}

pub fn history_key(agent_id: &str) -> String {
    format!("{}{}", HISTORY_PREFIX, agent_id)
}

/// Read the CAS token of a stored document.
pub fn version_of(value: &Value) -> u64 {
    value.get("version").and_then(Value::as_u64).unwrap_or(0)
}

/// Whether a CAS against `current` with `expected_version` may proceed.
pub fn version_matches(current: Option<&Value>, expected_version: u64) -> bool {
    match current {
        Some(value) => version_of(value) == expected_version,
        None => expected_version == 0,
    }
}

/// Check that a single identifier can be used as one key segment.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Validate a full key: `/`-separated non-empty segments.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.split('/').all(is_valid_segment) {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// The durable store contract. Both backends provide the same atomicity:
/// two conditional writes racing on one key never both succeed.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a document. Missing and malformed documents are both `None`.
    async fn read(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Unconditional upsert.
    async fn write(&self, key: &str, value: &Value) -> StoreResult<()>;

    /// Delete a document; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Compare-and-swap on the document's `version` field.
    ///
    /// Returns `Ok(false)` without writing when the stored version differs from
    /// `expected_version` (an absent key has version 0).
    async fn write_if_version(
        &self,
        key: &str,
        value: &Value,
        expected_version: u64,
    ) -> StoreResult<bool>;

    /// Subscribe to changes of one key. Local writes notify immediately; writes
    /// from other processes are picked up by polling. Must be called from within
    /// a tokio runtime.
    fn watch(&self, key: &str, on_change: WatchCallback) -> StoreResult<WatchHandle>;
}
