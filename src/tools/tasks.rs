//! Task CRUD tools.

use super::{ToolContext, get_bool, get_string, get_u64, make_tool, require_string, ToolDefinition};
use crate::coordinator::Coordinator;
use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::types::{MutationResult, NewTask, Task, TaskStatus, TaskUpdate};
use serde_json::{Value, json};
use std::collections::HashMap;

pub fn get_tools() -> Vec<ToolDefinition> {
    let task_fields = json!({
        "title": {
            "type": "string",
            "description": "Task title"
        },
        "description": {
            "type": "string",
            "description": "Task description"
        },
        "id": {
            "type": "string",
            "description": "Custom task ID (generated if omitted)"
        },
        "parent_id": {
            "type": "string",
            "description": "Parent task ID (reference only)"
        },
        "dependencies": {
            "type": "array",
            "items": { "type": "string" },
            "description": "Task IDs that must complete before this task can be claimed"
        },
        "metadata": {
            "type": "object",
            "description": "Free-form key/value data"
        }
    });

    vec![
        make_tool(
            "create_task",
            "Create a task. Tasks with dependencies start blocked and become pending once every dependency is completed.",
            task_fields.clone(),
            vec!["title"],
        ),
        make_tool(
            "batch_create_tasks",
            "Create several tasks, then validate their dependencies together. Fails with DEPENDENCY_CYCLE (listing the cycle and the created IDs) if they form a cycle.",
            json!({
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": task_fields,
                        "required": ["title"]
                    },
                    "description": "Tasks to create, in order"
                }
            }),
            vec!["tasks"],
        ),
        make_tool(
            "update_task",
            "Change a task's title or description and merge metadata (null removes a key).",
            json!({
                "task_id": {
                    "type": "string",
                    "description": "Task ID"
                },
                "title": { "type": "string" },
                "description": { "type": "string" },
                "metadata": {
                    "type": "object",
                    "description": "Keys to set; null values delete"
                },
                "expected_version": {
                    "type": "integer",
                    "description": "Fail with VERSION_CONFLICT unless the task is at this version"
                }
            }),
            vec!["task_id"],
        ),
        make_tool(
            "get_task",
            "Get a single task by ID.",
            json!({
                "task_id": {
                    "type": "string",
                    "description": "Task ID"
                }
            }),
            vec!["task_id"],
        ),
        make_tool(
            "list_tasks",
            "List tasks with optional filters.",
            json!({
                "status": {
                    "type": "string",
                    "enum": ["pending", "blocked", "in_progress", "completed", "failed", "cancelled"],
                    "description": "Only tasks in this status"
                },
                "agent_id": {
                    "type": "string",
                    "description": "Only tasks assigned to this agent"
                },
                "parent_id": {
                    "type": "string",
                    "description": "Only subtasks of this task"
                },
                "ready": {
                    "type": "boolean",
                    "description": "Only tasks that can be claimed now"
                }
            }),
            vec![],
        ),
    ]
}

/// The task of a successful mutation, or its failure as a tool error.
pub fn mutated_task(result: MutationResult) -> ToolResult<Task> {
    match (result.success, result.task) {
        (true, Some(task)) => Ok(task),
        _ => Err(ToolError::new(
            result.error_code.unwrap_or(ErrorCode::InternalError),
            result.message.unwrap_or_else(|| "Mutation failed".to_string()),
        )),
    }
}

/// Turn an engine outcome into a tool response.
pub fn mutation_response(result: MutationResult) -> ToolResult<Value> {
    let task = mutated_task(result)?;
    Ok(json!({ "success": true, "task": task }))
}

fn parse_new_task(args: &Value, created_by: &str) -> ToolResult<NewTask> {
    let mut task = NewTask::new(require_string(args, "title")?, created_by);
    if let Some(description) = get_string(args, "description") {
        task.description = description;
    }
    task.id = get_string(args, "id");
    task.parent_id = get_string(args, "parent_id");

    match args.get("dependencies") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for item in items {
                match item.as_str() {
                    Some(dep) => task.dependencies.push(dep.to_string()),
                    None => {
                        return Err(ToolError::invalid_value(
                            "dependencies",
                            "dependencies must be an array of task IDs",
                        ));
                    }
                }
            }
        }
        Some(_) => {
            return Err(ToolError::invalid_value(
                "dependencies",
                "dependencies must be an array of task IDs",
            ));
        }
    }

    task.metadata = parse_metadata(args)?.unwrap_or_default();
    Ok(task)
}

fn parse_metadata(args: &Value) -> ToolResult<Option<HashMap<String, Value>>> {
    match args.get("metadata") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )),
        Some(_) => Err(ToolError::invalid_value("metadata", "metadata must be an object")),
    }
}

/// Fail with DEPENDENCY_CYCLE if the given tasks reach a cycle.
async fn check_cycles(coord: &Coordinator, ids: &[String]) -> ToolResult<()> {
    let validation = coord.resolver().validate_dependencies(ids).await?;
    if let Some(cycle) = validation.cycle {
        return Err(ToolError::dependency_cycle(&cycle).with_details(json!({
            "cycle": cycle,
            "created": ids,
        })));
    }
    Ok(())
}

/// Re-read created tasks after the resolver had a chance to promote them.
async fn refreshed(coord: &Coordinator, created: Vec<Task>) -> ToolResult<Vec<Task>> {
    let mut out = Vec::with_capacity(created.len());
    for task in created {
        match coord.tasks().get_task(&task.id).await? {
            Some(fresh) => out.push(fresh),
            None => out.push(task),
        }
    }
    Ok(out)
}

pub async fn create_task(coord: &Coordinator, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
    let input = parse_new_task(&args, &ctx.agent_id)?;
    let has_dependencies = !input.dependencies.is_empty();

    if has_dependencies {
        let validation = coord
            .resolver()
            .validate_new_task(input.id.as_deref(), &input.dependencies)
            .await?;
        if let Some(cycle) = validation.cycle {
            return Err(ToolError::dependency_cycle(&cycle).with_details(json!({
                "cycle": cycle,
                "created": [],
            })));
        }
    }

    let task = mutated_task(coord.tasks().create_task(input).await)?;
    if !has_dependencies {
        return Ok(json!({ "success": true, "task": task }));
    }

    coord.resolver().update_task_statuses().await?;
    let task = refreshed(coord, vec![task]).await?.remove(0);
    Ok(json!({ "success": true, "task": task }))
}

pub async fn batch_create_tasks(
    coord: &Coordinator,
    ctx: &ToolContext,
    args: Value,
) -> ToolResult<Value> {
    let items = match args.get("tasks") {
        Some(Value::Array(items)) if !items.is_empty() => items.clone(),
        Some(Value::Array(_)) | None | Some(Value::Null) => {
            return Err(ToolError::missing_field("tasks"));
        }
        Some(_) => return Err(ToolError::invalid_value("tasks", "tasks must be an array")),
    };

    // Validate every entry before writing anything.
    let inputs = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            parse_new_task(item, &ctx.agent_id).map_err(|e| {
                let field = format!("tasks[{}].{}", i, e.field.clone().unwrap_or_default());
                ToolError::new(e.code, format!("tasks[{}]: {}", i, e.message)).with_field(field)
            })
        })
        .collect::<ToolResult<Vec<_>>>()?;

    let mut created: Vec<Task> = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.into_iter().enumerate() {
        let result = coord.tasks().create_task(input).await;
        match (result.success, result.task) {
            (true, Some(task)) => created.push(task),
            _ => {
                let ids: Vec<&str> = created.iter().map(|t| t.id.as_str()).collect();
                return Err(ToolError::new(
                    result.error_code.unwrap_or(ErrorCode::InternalError),
                    format!(
                        "tasks[{}]: {}",
                        i,
                        result.message.unwrap_or_else(|| "create failed".to_string())
                    ),
                )
                .with_details(json!({ "failed_index": i, "created": ids })));
            }
        }
    }

    let ids: Vec<String> = created.iter().map(|t| t.id.clone()).collect();
    check_cycles(coord, &ids).await?;
    let pass = coord.resolver().update_task_statuses().await?;
    let tasks = refreshed(coord, created).await?;

    Ok(json!({
        "success": true,
        "tasks": tasks,
        "count": tasks.len(),
        "promoted": pass.promoted,
    }))
}

pub async fn update_task(coord: &Coordinator, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let expected_version = get_u64(&args, "expected_version")?;
    let update = TaskUpdate {
        title: get_string(&args, "title"),
        description: get_string(&args, "description"),
        metadata: parse_metadata(&args)?,
    };
    if update.is_empty() {
        return Err(ToolError::new(
            ErrorCode::MissingRequiredField,
            "Provide at least one of title, description, metadata",
        ));
    }

    mutation_response(
        coord
            .tasks()
            .update_task(&task_id, update, expected_version)
            .await,
    )
}

pub async fn get_task(coord: &Coordinator, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    match coord.tasks().get_task(&task_id).await? {
        Some(task) => Ok(json!({ "success": true, "task": task })),
        None => Err(ToolError::task_not_found(&task_id)),
    }
}

pub async fn list_tasks(coord: &Coordinator, args: Value) -> ToolResult<Value> {
    let status = match get_string(&args, "status") {
        Some(s) => Some(TaskStatus::parse(&s).ok_or_else(|| {
            ToolError::invalid_value("status", &format!("Unknown status '{}'", s))
        })?),
        None => None,
    };
    let agent_id = get_string(&args, "agent_id");
    let parent_id = get_string(&args, "parent_id");
    let ready = get_bool(&args, "ready").unwrap_or(false);

    let mut tasks = if ready {
        coord.resolver().get_ready_tasks().await?
    } else {
        coord.tasks().list_tasks().await?
    };
    tasks.retain(|t| {
        status.is_none_or(|s| t.status == s)
            && agent_id
                .as_deref()
                .is_none_or(|a| t.assigned_to.as_deref() == Some(a))
            && parent_id
                .as_deref()
                .is_none_or(|p| t.parent_id.as_deref() == Some(p))
    });

    Ok(json!({
        "success": true,
        "tasks": tasks,
        "count": tasks.len(),
    }))
}
