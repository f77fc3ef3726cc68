//! Core types for task coordination.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Blocked,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "blocked" => Some(TaskStatus::Blocked),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work, stored as one record under `tasks/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Optimistic-concurrency token; bumped by every successful mutation.
    pub version: u64,
    #[serde(default)]
    pub assigned_to: Option<String>,
    pub created_by: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub claimed_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    /// Custom task ID (optional, UUID7 generated if not provided).
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            created_by: created_by.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Partial update of a task's descriptive fields.
///
/// `metadata` is merged key-wise; a `null` value removes the key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.metadata.is_none()
    }
}

/// Outcome of a task mutation. Failures are data, not panics or errors.
#[derive(Debug, Clone, Serialize)]
pub struct MutationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(rename = "code", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MutationResult {
    pub fn ok(task: Task) -> Self {
        Self {
            success: true,
            task: Some(task),
            error_code: None,
            message: None,
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            task: None,
            error_code: Some(code),
            message: Some(message.into()),
        }
    }
}

/// Stored liveness flag of an agent. Readers derive offline-ness from heartbeat age too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// A worker process identity, stored under `agents/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Process id of the registering process (diagnostic only).
    pub pid: u32,
    pub start_time: i64,
    pub last_heartbeat: i64,
    pub status: AgentStatus,
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    /// Whether the agent counts as live at `now` for the given threshold.
    pub fn is_live(&self, now: i64, offline_threshold_ms: i64) -> bool {
        self.status == AgentStatus::Online && now - self.last_heartbeat < offline_threshold_ms
    }
}

/// Agent info with derived liveness for listings.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    #[serde(flatten)]
    pub agent: Agent,
    pub online: bool,
    pub heartbeat_age_ms: i64,
}

/// Result of dependency validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<String>>,
}

impl DependencyValidation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            cycle: None,
        }
    }

    pub fn cyclic(cycle: Vec<String>) -> Self {
        Self {
            valid: false,
            cycle: Some(cycle),
        }
    }
}

/// Summary of one resolver pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolverPass {
    pub examined: usize,
    pub promoted: Vec<String>,
    pub conflicts: usize,
}

/// Summary of one recovery sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub released: Vec<String>,
    pub conflicts: usize,
}

/// One entry of an agent's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: i64,
    pub action: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}
