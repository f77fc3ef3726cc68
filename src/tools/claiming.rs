//! Task claiming and lifecycle tools.
//!
//! Ownership is checked here, not in the engine: complete, fail and release
//! require the caller to hold the task, cancel requires the caller to have
//! created it. The check pins the version it observed, so the task cannot be
//! handed to someone else between the check and the write.

use super::tasks::{mutated_task, mutation_response};
use super::{ToolContext, ToolDefinition, get_u64, make_tool, require_string};
use crate::coordinator::Coordinator;
use crate::error::{ToolError, ToolResult};
use crate::types::{Task, TaskStatus};
use serde_json::{Value, json};

fn task_id_property(verb: &str) -> Value {
    json!({
        "task_id": {
            "type": "string",
            "description": format!("Task ID to {}", verb)
        },
        "expected_version": {
            "type": "integer",
            "description": "Fail with VERSION_CONFLICT unless the task is at this version"
        }
    })
}

pub fn get_tools() -> Vec<ToolDefinition> {
    vec![
        make_tool(
            "claim_task",
            "Claim a pending task before working on it. Exactly one of several concurrent claims succeeds; the others get INVALID_STATE or VERSION_CONFLICT. Sets status to in_progress. The claim lasts only while the claiming agent is registered and heartbeating: a task claimed by an unregistered caller (such as a one-shot `call`) is released by the next recovery sweep.",
            task_id_property("claim"),
            vec!["task_id"],
        ),
        make_tool(
            "complete_task",
            "Mark a claimed task completed. Must be the current owner. Dependent tasks whose prerequisites are now all completed become pending.",
            task_id_property("complete"),
            vec!["task_id"],
        ),
        make_tool(
            "fail_task",
            "Mark a claimed task failed. Must be the current owner.",
            task_id_property("fail"),
            vec!["task_id"],
        ),
        make_tool(
            "cancel_task",
            "Cancel a task that has not finished. Only the creator may cancel.",
            task_id_property("cancel"),
            vec!["task_id"],
        ),
        make_tool(
            "release_task",
            "Release a claimed task without completing it. Resets status to pending so another agent can claim it. Must be the current owner.",
            task_id_property("release"),
            vec!["task_id"],
        ),
    ]
}

async fn load(coord: &Coordinator, task_id: &str) -> ToolResult<Task> {
    coord
        .tasks()
        .get_task(task_id)
        .await?
        .ok_or_else(|| ToolError::task_not_found(task_id))
}

/// Load a task the caller must hold while it is in progress.
async fn held_task(coord: &Coordinator, ctx: &ToolContext, task_id: &str) -> ToolResult<Task> {
    let task = load(coord, task_id).await?;
    if task.status == TaskStatus::InProgress && task.assigned_to.as_deref() != Some(ctx.agent_id.as_str()) {
        return Err(ToolError::not_owner(task_id, &ctx.agent_id));
    }
    Ok(task)
}

pub async fn claim_task(coord: &Coordinator, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let expected_version = get_u64(&args, "expected_version")?;

    mutation_response(
        coord
            .tasks()
            .claim_task(&task_id, &ctx.agent_id, expected_version)
            .await,
    )
}

pub async fn complete_task(coord: &Coordinator, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let expected_version = get_u64(&args, "expected_version")?;
    let task = held_task(coord, ctx, &task_id).await?;

    let completed = mutated_task(
        coord
            .tasks()
            .complete_task(&task_id, Some(expected_version.unwrap_or(task.version)))
            .await,
    )?;
    let pass = coord.resolver().update_task_statuses().await?;

    Ok(json!({
        "success": true,
        "task": completed,
        "promoted": pass.promoted,
    }))
}

pub async fn fail_task(coord: &Coordinator, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let expected_version = get_u64(&args, "expected_version")?;
    let task = held_task(coord, ctx, &task_id).await?;

    mutation_response(
        coord
            .tasks()
            .fail_task(&task_id, Some(expected_version.unwrap_or(task.version)))
            .await,
    )
}

pub async fn release_task(coord: &Coordinator, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let expected_version = get_u64(&args, "expected_version")?;
    let task = held_task(coord, ctx, &task_id).await?;

    mutation_response(
        coord
            .tasks()
            .release_task(&task_id, Some(expected_version.unwrap_or(task.version)))
            .await,
    )
}

pub async fn cancel_task(coord: &Coordinator, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let expected_version = get_u64(&args, "expected_version")?;
    let task = load(coord, &task_id).await?;
    if task.created_by != ctx.agent_id {
        return Err(ToolError::not_creator(&task_id, &ctx.agent_id));
    }

    mutation_response(
        coord
            .tasks()
            .cancel_task(&task_id, Some(expected_version.unwrap_or(task.version)))
            .await,
    )
}
