//! JSON-lines request loop for `agent-tasks serve`.
//!
//! Each input line is `{"tool": "<name>", "args": {...}, "id": <any>?}`; each
//! output line is the tool's JSON result, with `id` echoed when given.

use crate::error::{ErrorCode, ToolError};
use crate::tools::{ToolContext, ToolHandler};
use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Request {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    id: Option<Value>,
}

/// Answer one request line.
pub async fn handle_line(handler: &ToolHandler, ctx: &ToolContext, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return ToolError::new(
                ErrorCode::InvalidFieldValue,
                format!("Malformed request: {}", e),
            )
            .to_response();
        }
    };

    debug!(tool = %request.tool, agent_id = %ctx.agent_id, "Tool call");
    let mut response = handler.call_tool(ctx, &request.tool, request.args).await;
    if let Some(id) = request.id
        && let Some(obj) = response.as_object_mut()
    {
        obj.insert("id".to_string(), id);
    }
    response
}

/// Serve requests until `reader` reaches EOF.
pub async fn serve_lines<R, W>(
    handler: &ToolHandler,
    ctx: &ToolContext,
    reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(handler, ctx, line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
    }
    Ok(())
}
