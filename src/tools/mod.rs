//! Tool implementations: the JSON boundary over the coordinator.
//!
//! Every tool takes a JSON argument object and returns a JSON result. Failures
//! never escape as Rust errors; they become `{success: false, error, code}`.

pub mod agents;
pub mod claiming;
pub mod context;
pub mod tasks;

pub use context::ToolContext;

use crate::coordinator::Coordinator;
use crate::error::{ToolError, ToolResult};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tools whose calls are appended to the caller's execution history.
const RECORDED_TOOLS: &[&str] = &[
    "create_task",
    "batch_create_tasks",
    "claim_task",
    "complete_task",
    "fail_task",
    "cancel_task",
    "release_task",
    "update_task",
];

/// Name, description and JSON input schema of a tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Tool handler that dispatches calls by name.
pub struct ToolHandler {
    coordinator: Arc<Coordinator>,
}

impl ToolHandler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Get all available tools.
    pub fn get_tools(&self) -> Vec<ToolDefinition> {
        let mut tools = Vec::new();

        // Task tools
        tools.extend(tasks::get_tools());

        // Claiming tools
        tools.extend(claiming::get_tools());

        // Agent tools
        tools.extend(agents::get_tools());

        tools
    }

    /// Call a tool by name, always producing a JSON response.
    pub async fn call_tool(&self, ctx: &ToolContext, name: &str, arguments: Value) -> Value {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let task_id = get_string(&arguments, "task_id");

        let outcome = self.dispatch(ctx, name, arguments).await;
        if RECORDED_TOOLS.contains(&name) {
            self.record(ctx, name, task_id, &outcome).await;
        }

        match outcome {
            Ok(value) => value,
            Err(err) => {
                debug!(tool = name, code = %err.code, error = %err.message, "Tool call failed");
                err.to_response()
            }
        }
    }

    async fn dispatch(&self, ctx: &ToolContext, name: &str, args: Value) -> ToolResult<Value> {
        let coord = self.coordinator.as_ref();
        match name {
            // Task tools
            "create_task" => tasks::create_task(coord, ctx, args).await,
            "batch_create_tasks" => tasks::batch_create_tasks(coord, ctx, args).await,
            "update_task" => tasks::update_task(coord, args).await,
            "get_task" => tasks::get_task(coord, args).await,
            "list_tasks" => tasks::list_tasks(coord, args).await,

            // Claiming tools
            "claim_task" => claiming::claim_task(coord, ctx, args).await,
            "complete_task" => claiming::complete_task(coord, ctx, args).await,
            "fail_task" => claiming::fail_task(coord, ctx, args).await,
            "cancel_task" => claiming::cancel_task(coord, ctx, args).await,
            "release_task" => claiming::release_task(coord, ctx, args).await,

            // Agent tools
            "list_agents" => agents::list_agents(coord, args).await,
            "get_history" => agents::get_history(coord, ctx, args).await,

            _ => Err(ToolError::unknown_tool(name)),
        }
    }

    async fn record(
        &self,
        ctx: &ToolContext,
        name: &str,
        task_id: Option<String>,
        outcome: &ToolResult<Value>,
    ) {
        let (task_id, failure) = match outcome {
            Ok(value) => (
                task_id.or_else(|| get_string(value.get("task").unwrap_or(&Value::Null), "id")),
                None,
            ),
            Err(err) => (task_id, Some(err.code)),
        };
        if let Err(e) = self
            .coordinator
            .history()
            .record(&ctx.agent_id, name, task_id, failure)
            .await
        {
            warn!(agent_id = %ctx.agent_id, error = %e, "Failed to record history");
        }
    }
}

/// Helper to create a tool definition.
pub fn make_tool(name: &str, description: &str, properties: Value, required: Vec<&str>) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

/// Helper to get a string from arguments.
pub fn get_string(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str().map(String::from))
}

/// Helper to get a required string from arguments.
pub fn require_string(args: &Value, key: &str) -> ToolResult<String> {
    match args.get(key) {
        None | Some(Value::Null) => Err(ToolError::missing_field(key)),
        Some(Value::String(s)) if s.is_empty() => Err(ToolError::missing_field(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ToolError::invalid_value(key, &format!("{} must be a string", key))),
    }
}

/// Helper to get a bool from arguments.
pub fn get_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

/// Helper to get an optional non-negative integer, rejecting other types.
pub fn get_u64(args: &Value, key: &str) -> ToolResult<Option<u64>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            ToolError::invalid_value(key, &format!("{} must be a non-negative integer", key))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_string_rejects_missing_and_empty() {
        let args = json!({"task_id": "", "n": 3});
        assert!(require_string(&args, "task_id").is_err());
        assert!(require_string(&args, "other").is_err());
        assert_eq!(
            require_string(&args, "n").unwrap_err().code,
            crate::error::ErrorCode::InvalidFieldValue
        );
    }

    #[test]
    fn get_u64_validates_type() {
        let args = json!({"v": 2, "bad": "two", "neg": -1});
        assert_eq!(get_u64(&args, "v").unwrap(), Some(2));
        assert_eq!(get_u64(&args, "missing").unwrap(), None);
        assert!(get_u64(&args, "bad").is_err());
        assert!(get_u64(&args, "neg").is_err());
    }

    #[test]
    fn make_tool_builds_object_schema() {
        let tool = make_tool("get_task", "Get a task", json!({"task_id": {"type": "string"}}), vec!["task_id"]);
        assert_eq!(tool.input_schema["type"], "object");
        assert_eq!(tool.input_schema["required"], json!(["task_id"]));
    }
}
