//! Task store and mutation engine.
//!
//! Every task lives in its own `tasks/<id>` record and carries its own
//! `version`. All status changes are read-modify-CAS cycles against that
//! version; losing a CAS re-reads and retries with exponential backoff unless
//! the caller pinned an `expected_version`, in which case the conflict is
//! reported immediately.

pub mod resolver;

pub use resolver::{DependencyResolver, find_cycle};

use crate::db::now_ms;
use crate::error::ErrorCode;
use crate::store::{Store, TASK_PREFIX, is_valid_segment, task_key};
use crate::types::{MutationResult, NewTask, Task, TaskStatus, TaskUpdate};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded retry discipline for lost CAS races.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub backoff_base: Duration,
}

impl Default for ClaimRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl ClaimRetryPolicy {
    /// Sleep after the failed attempt number `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Rejection produced by a mutation closure.
type Rejection = (ErrorCode, String);

fn invalid_state(task: &Task, wanted: &str) -> Rejection {
    (
        ErrorCode::InvalidState,
        format!(
            "Task {} is {} (expected {})",
            task.id,
            task.status.as_str(),
            wanted
        ),
    )
}

/// Task CRUD and status transitions over a shared [`Store`].
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn Store>,
    retry: ClaimRetryPolicy,
}

impl TaskStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_retry(store, ClaimRetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn Store>, retry: ClaimRetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn retry_policy(&self) -> ClaimRetryPolicy {
        self.retry
    }

    /// Create a task. Tasks with dependencies start BLOCKED.
    pub async fn create_task(&self, input: NewTask) -> MutationResult {
        let id = match input.id {
            Some(id) if !is_valid_segment(&id) => {
                return MutationResult::err(
                    ErrorCode::InvalidState,
                    format!("Task id '{}' contains unsupported characters", id),
                );
            }
            Some(id) => id,
            None => uuid::Uuid::now_v7().to_string(),
        };
        let key = task_key(&id);

        match self.store.exists(&key).await {
            Ok(true) => {
                return MutationResult::err(
                    ErrorCode::InvalidState,
                    format!("Task {} already exists", id),
                );
            }
            Ok(false) => {}
            Err(e) => return MutationResult::err(ErrorCode::InternalError, e.to_string()),
        }

        let now = now_ms();
        let dependencies: BTreeSet<String> = input.dependencies.into_iter().collect();
        let status = if dependencies.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        let task = Task {
            id,
            parent_id: input.parent_id,
            title: input.title,
            description: input.description,
            status,
            version: 0,
            assigned_to: None,
            created_by: input.created_by,
            dependencies,
            claimed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            metadata: input.metadata,
        };

        let value = match serde_json::to_value(&task) {
            Ok(value) => value,
            Err(e) => return MutationResult::err(ErrorCode::InternalError, e.to_string()),
        };
        match self.store.write_if_version(&key, &value, 0).await {
            Ok(true) => {
                info!(task_id = %task.id, status = %task.status, "Created task");
                MutationResult::ok(task)
            }
            Ok(false) => MutationResult::err(
                ErrorCode::InvalidState,
                format!("Task {} already exists", task.id),
            ),
            Err(e) => MutationResult::err(ErrorCode::InternalError, e.to_string()),
        }
    }

    /// Claim a PENDING task for `agent_id`. At most one concurrent claim wins.
    pub async fn claim_task(
        &self,
        task_id: &str,
        agent_id: &str,
        expected_version: Option<u64>,
    ) -> MutationResult {
        self.mutate(task_id, expected_version, "claim", |task, now| {
            if task.status != TaskStatus::Pending {
                return Err(invalid_state(task, "pending"));
            }
            if let Some(owner) = &task.assigned_to {
                return Err((
                    ErrorCode::InvalidState,
                    format!("Task {} is already assigned to {}", task.id, owner),
                ));
            }
            task.status = TaskStatus::InProgress;
            task.assigned_to = Some(agent_id.to_string());
            task.claimed_at = Some(now);
            Ok(())
        })
        .await
    }

    pub async fn complete_task(&self, task_id: &str, expected_version: Option<u64>) -> MutationResult {
        self.finish(task_id, expected_version, TaskStatus::Completed).await
    }

    pub async fn fail_task(&self, task_id: &str, expected_version: Option<u64>) -> MutationResult {
        self.finish(task_id, expected_version, TaskStatus::Failed).await
    }

    async fn finish(
        &self,
        task_id: &str,
        expected_version: Option<u64>,
        outcome: TaskStatus,
    ) -> MutationResult {
        self.mutate(task_id, expected_version, outcome.as_str(), |task, now| {
            if task.status != TaskStatus::InProgress {
                return Err(invalid_state(task, "in_progress"));
            }
            task.status = outcome;
            task.completed_at = Some(now);
            task.assigned_to = None;
            task.claimed_at = None;
            Ok(())
        })
        .await
    }

    /// Cancel any non-terminal task.
    pub async fn cancel_task(&self, task_id: &str, expected_version: Option<u64>) -> MutationResult {
        self.mutate(task_id, expected_version, "cancel", |task, now| {
            if task.status.is_terminal() {
                return Err(invalid_state(task, "a non-terminal status"));
            }
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now);
            task.assigned_to = None;
            task.claimed_at = None;
            Ok(())
        })
        .await
    }

    /// Return an IN_PROGRESS task to PENDING, dropping its assignment.
    pub async fn release_task(&self, task_id: &str, expected_version: Option<u64>) -> MutationResult {
        self.mutate(task_id, expected_version, "release", |task, _| {
            if task.status != TaskStatus::InProgress {
                return Err(invalid_state(task, "in_progress"));
            }
            task.status = TaskStatus::Pending;
            task.assigned_to = None;
            task.claimed_at = None;
            Ok(())
        })
        .await
    }

    /// BLOCKED -> PENDING. Only the resolver decides when this is due.
    pub(crate) async fn promote_task(&self, task_id: &str, expected_version: u64) -> MutationResult {
        self.mutate(task_id, Some(expected_version), "promote", |task, _| {
            if task.status != TaskStatus::Blocked {
                return Err(invalid_state(task, "blocked"));
            }
            task.status = TaskStatus::Pending;
            Ok(())
        })
        .await
    }

    /// Change title/description and merge metadata (`null` removes a key).
    pub async fn update_task(
        &self,
        task_id: &str,
        update: TaskUpdate,
        expected_version: Option<u64>,
    ) -> MutationResult {
        self.mutate(task_id, expected_version, "update", |task, _| {
            if let Some(title) = &update.title {
                task.title = title.clone();
            }
            if let Some(description) = &update.description {
                task.description = description.clone();
            }
            if let Some(metadata) = &update.metadata {
                for (k, v) in metadata {
                    if v.is_null() {
                        task.metadata.remove(k);
                    } else {
                        task.metadata.insert(k.clone(), v.clone());
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Read-modify-CAS loop shared by every mutation.
    async fn mutate<F>(
        &self,
        task_id: &str,
        expected_version: Option<u64>,
        action: &str,
        apply: F,
    ) -> MutationResult
    where
        F: Fn(&mut Task, i64) -> Result<(), Rejection>,
    {
        let key = task_key(task_id);
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            let current = match self.get_task(task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    return MutationResult::err(
                        ErrorCode::TaskNotFound,
                        format!("Task not found: {}", task_id),
                    );
                }
                Err(e) => return MutationResult::err(ErrorCode::InternalError, e.to_string()),
            };

            if let Some(expected) = expected_version
                && current.version != expected
            {
                return MutationResult::err(
                    ErrorCode::VersionConflict,
                    format!(
                        "Task {} is at version {}, expected {}",
                        task_id, current.version, expected
                    ),
                );
            }

            let now = now_ms();
            let mut next = current.clone();
            if let Err((code, message)) = apply(&mut next, now) {
                return MutationResult::err(code, message);
            }
            next.version = current.version + 1;
            next.updated_at = now;

            let value = match serde_json::to_value(&next) {
                Ok(value) => value,
                Err(e) => return MutationResult::err(ErrorCode::InternalError, e.to_string()),
            };

            match self.store.write_if_version(&key, &value, current.version).await {
                Ok(true) => {
                    debug!(task_id, action, version = next.version, attempt, "Task mutated");
                    return MutationResult::ok(next);
                }
                Ok(false) if expected_version.is_some() => {
                    return MutationResult::err(
                        ErrorCode::VersionConflict,
                        format!("Task {} changed concurrently", task_id),
                    );
                }
                Ok(false) => {
                    debug!(task_id, action, attempt, "Lost CAS race");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
                Err(e) => return MutationResult::err(ErrorCode::InternalError, e.to_string()),
            }
        }

        warn!(task_id, action, attempts, "Giving up after repeated CAS conflicts");
        MutationResult::err(
            ErrorCode::VersionConflict,
            format!(
                "Task {} kept changing; gave up after {} attempts",
                task_id, attempts
            ),
        )
    }

    /// Current snapshot of a task. Malformed records read as absent.
    pub async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        if !is_valid_segment(task_id) {
            return Ok(None);
        }
        let value = self.store.read(&task_key(task_id)).await?;
        Ok(value.and_then(|v| decode_task(task_id, v)))
    }

    /// All tasks, oldest first.
    pub async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let keys = self.store.list(TASK_PREFIX).await?;
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches(TASK_PREFIX);
            if let Some(value) = self.store.read(&key).await?
                && let Some(task) = decode_task(id, value)
            {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> anyhow::Result<Vec<Task>> {
        let mut tasks = self.list_tasks().await?;
        tasks.retain(|t| t.status == status);
        Ok(tasks)
    }

    pub async fn get_tasks_by_agent(&self, agent_id: &str) -> anyhow::Result<Vec<Task>> {
        let mut tasks = self.list_tasks().await?;
        tasks.retain(|t| t.assigned_to.as_deref() == Some(agent_id));
        Ok(tasks)
    }

    pub async fn get_subtasks(&self, parent_id: &str) -> anyhow::Result<Vec<Task>> {
        let mut tasks = self.list_tasks().await?;
        tasks.retain(|t| t.parent_id.as_deref() == Some(parent_id));
        Ok(tasks)
    }
}

fn decode_task(task_id: &str, value: Value) -> Option<Task> {
    match serde_json::from_value::<Task>(value) {
        Ok(task) => Some(task),
        Err(e) => {
            warn!(task_id, error = %e, "Ignoring malformed task record");
            None
        }
    }
}
