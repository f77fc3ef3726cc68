//! Recovery sweeper: hands tasks held by dead agents back to the pool.

use crate::agents::AgentRegistry;
use crate::tasks::TaskStore;
use crate::types::{SweepReport, TaskStatus};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(30_000);

#[derive(Clone)]
pub struct RecoverySweeper {
    tasks: TaskStore,
    agents: Arc<AgentRegistry>,
}

impl RecoverySweeper {
    pub fn new(tasks: TaskStore, agents: Arc<AgentRegistry>) -> Self {
        Self { tasks, agents }
    }

    /// Release every IN_PROGRESS task whose assignee is offline.
    ///
    /// Each release is pinned to the version observed here, so a task the
    /// owner completed in the meantime is skipped rather than reopened.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for task in self.tasks.get_tasks_by_status(TaskStatus::InProgress).await? {
            let Some(owner) = task.assigned_to.as_deref() else {
                continue;
            };
            report.examined += 1;
            if !self.agents.is_agent_offline(owner).await? {
                continue;
            }

            let result = self.tasks.release_task(&task.id, Some(task.version)).await;
            if result.success {
                info!(task_id = %task.id, agent_id = owner, "Released task held by offline agent");
                report.released.push(task.id.clone());
            } else {
                debug!(task_id = %task.id, code = ?result.error_code, "Task moved on before release");
                report.conflicts += 1;
            }
        }

        Ok(report)
    }

    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(report) if !report.released.is_empty() => {
                        info!(released = report.released.len(), "Recovery sweep finished");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Recovery sweep failed"),
                }
            }
        })
    }
}
