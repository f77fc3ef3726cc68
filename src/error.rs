//! Error types: store failures, mutation error codes and structured tool errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failures of the durable store layer.
///
/// These are never retried inside the coordination core; the mutation engine
/// reports them to callers as [`ErrorCode::InternalError`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid store key '{0}'")]
    InvalidKey(String),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("timed out waiting for lock on '{0}'")]
    LockTimeout(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Mutation outcomes
    TaskNotFound,
    InvalidState,
    /// Reserved for single-active-task-per-agent policies.
    AgentHasActiveTask,
    VersionConflict,
    InternalError,

    // Tool boundary
    MissingRequiredField,
    InvalidFieldValue,
    NotOwner,
    DependencyCycle,
    UnknownTool,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::AgentHasActiveTask => "AGENT_HAS_ACTIVE_TASK",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::NotOwner => "NOT_OWNER",
            ErrorCode::DependencyCycle => "DEPENDENCY_CYCLE",
            ErrorCode::UnknownTool => "UNKNOWN_TOOL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error for tool responses.
#[derive(Debug, Serialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn not_owner(task_id: &str, agent_id: &str) -> Self {
        Self::new(
            ErrorCode::NotOwner,
            format!("Agent {} does not own task {}", agent_id, task_id),
        )
    }

    pub fn not_creator(task_id: &str, agent_id: &str) -> Self {
        Self::new(
            ErrorCode::NotOwner,
            format!("Only the creator of task {} may cancel it (caller: {})", task_id, agent_id),
        )
    }

    pub fn dependency_cycle(cycle: &[String]) -> Self {
        Self::new(
            ErrorCode::DependencyCycle,
            format!("Dependency cycle detected: {}", cycle.join(" -> ")),
        )
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorCode::UnknownTool, format!("Unknown tool: {}", name))
    }

    /// Render as the `{success: false, error, code}` payload returned to callers.
    pub fn to_response(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        });
        if let Some(ref field) = self.field {
            body["field"] = serde_json::json!(field);
        }
        if let Some(ref details) = self.details {
            body["details"] = details.clone();
        }
        body
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ToolError {}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        ToolError::internal(err)
    }
}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ToolError>() {
            Ok(tool_err) => tool_err,
            Err(err) => ToolError::internal(err),
        }
    }
}

/// Result type for tool operations.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        let json = serde_json::to_value(ErrorCode::VersionConflict).unwrap();
        assert_eq!(json, "VERSION_CONFLICT");
        assert_eq!(ErrorCode::TaskNotFound.as_str(), "TASK_NOT_FOUND");
    }

    #[test]
    fn tool_error_response_shape() {
        let err = ToolError::missing_field("task_id");
        let body = err.to_response();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "MISSING_REQUIRED_FIELD");
        assert_eq!(body["error"], "task_id is required");
        assert_eq!(body["field"], "task_id");
    }

    #[test]
    fn anyhow_roundtrip_preserves_tool_error() {
        let err: anyhow::Error = ToolError::task_not_found("t1").into();
        let back: ToolError = err.into();
        assert_eq!(back.code, ErrorCode::TaskNotFound);
    }
}
