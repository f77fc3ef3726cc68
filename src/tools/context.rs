//! Per-request context passed to tool functions.

/// Identity of the caller of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    /// Agent on whose behalf the call is made; used for claims, ownership
    /// checks and execution history.
    pub agent_id: String,
}

impl ToolContext {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}
