//! Agent roster and history tools.

use super::{ToolContext, ToolDefinition, get_bool, get_string, make_tool};
use crate::coordinator::Coordinator;
use crate::error::ToolResult;
use serde_json::{Value, json};

pub fn get_tools() -> Vec<ToolDefinition> {
    vec![
        make_tool(
            "list_agents",
            "List registered agents with derived liveness (online means a fresh heartbeat).",
            json!({
                "online_only": {
                    "type": "boolean",
                    "description": "Only agents that are online now (default: false)"
                }
            }),
            vec![],
        ),
        make_tool(
            "get_history",
            "Get an agent's recent task actions, oldest first.",
            json!({
                "agent_id": {
                    "type": "string",
                    "description": "Agent ID (default: the caller)"
                }
            }),
            vec![],
        ),
    ]
}

pub async fn list_agents(coord: &Coordinator, args: Value) -> ToolResult<Value> {
    let online_only = get_bool(&args, "online_only").unwrap_or(false);

    let mut agents = coord.agents().list_agents().await?;
    if online_only {
        agents.retain(|a| a.online);
    }

    Ok(json!({
        "success": true,
        "agents": agents,
        "count": agents.len(),
        "offline_threshold_ms": coord.agents().offline_threshold_ms(),
    }))
}

pub async fn get_history(coord: &Coordinator, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
    let agent_id = get_string(&args, "agent_id").unwrap_or_else(|| ctx.agent_id.clone());
    let entries = coord.history().entries(&agent_id).await?;

    Ok(json!({
        "success": true,
        "agent_id": agent_id,
        "entries": entries,
    }))
}
