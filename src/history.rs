//! Per-agent execution history.
//!
//! `history/<agent-id>` has a single writer (the agent itself), so it is
//! updated with a plain write.

use crate::db::now_ms;
use crate::error::ErrorCode;
use crate::store::{Store, history_key, is_valid_segment};
use crate::types::HistoryEntry;
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_MAX_ENTRIES: usize = 200;

#[derive(Clone)]
pub struct ExecutionHistory {
    store: Arc<dyn Store>,
    max_entries: usize,
}

impl ExecutionHistory {
    pub fn new(store: Arc<dyn Store>, max_entries: usize) -> Self {
        Self { store, max_entries }
    }

    /// Entries for `agent_id`, oldest first.
    pub async fn entries(&self, agent_id: &str) -> Result<Vec<HistoryEntry>> {
        if !is_valid_segment(agent_id) {
            return Ok(Vec::new());
        }
        let Some(doc) = self.store.read(&history_key(agent_id)).await? else {
            return Ok(Vec::new());
        };
        let entries = doc.get("entries").cloned().unwrap_or_else(|| json!([]));
        match serde_json::from_value(entries) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(agent_id, error = %e, "Ignoring malformed history");
                Ok(Vec::new())
            }
        }
    }

    pub async fn append(&self, agent_id: &str, entry: HistoryEntry) -> Result<()> {
        if self.max_entries == 0 || !is_valid_segment(agent_id) {
            return Ok(());
        }
        let mut entries = self.entries(agent_id).await?;
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
        self.store
            .write(&history_key(agent_id), &json!({ "entries": entries }))
            .await?;
        Ok(())
    }

    /// Record one tool call. `failure` carries the error code of a call that failed.
    pub async fn record(
        &self,
        agent_id: &str,
        action: &str,
        task_id: Option<String>,
        failure: Option<ErrorCode>,
    ) -> Result<()> {
        self.append(
            agent_id,
            HistoryEntry {
                at: now_ms(),
                action: action.to_string(),
                task_id,
                success: failure.is_none(),
                code: failure,
            },
        )
        .await
    }
}
