//! Dependency graph validation and BLOCKED -> PENDING propagation.

use super::TaskStore;
use crate::types::{DependencyValidation, ResolverPass, Task, TaskStatus};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Depth-first search for a cycle reachable from `roots`.
///
/// Returns the cycle in discovery order, closed by repeating its first node
/// (`a -> b -> a` is `["a", "b", "a"]`). Ids missing from `graph` are leaves.
pub fn find_cycle(graph: &HashMap<String, Vec<String>>, roots: &[String]) -> Option<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();

    for root in roots {
        if visited.contains(root.as_str()) {
            continue;
        }

        // Explicit stack of (node, next edge index) keeps deep chains off the call stack.
        let mut path: Vec<&str> = vec![root.as_str()];
        let mut on_path: HashSet<&str> = HashSet::from([root.as_str()]);
        let mut frames: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        visited.insert(root.as_str());

        while let Some((node, edge)) = frames.last_mut() {
            let edges = graph.get(*node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(next) = edges.get(*edge) {
                *edge += 1;
                let next = next.as_str();
                if on_path.contains(next) {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                if visited.insert(next) {
                    path.push(next);
                    on_path.insert(next);
                    frames.push((next, 0));
                }
            } else {
                on_path.remove(*node);
                path.pop();
                frames.pop();
            }
        }
    }

    None
}

fn graph_of(tasks: &[Task]) -> HashMap<String, Vec<String>> {
    tasks
        .iter()
        .map(|t| (t.id.clone(), t.dependencies.iter().cloned().collect()))
        .collect()
}

/// Whether every dependency of `task` exists and is COMPLETED.
fn dependencies_met(task: &Task, by_id: &HashMap<&str, &Task>) -> bool {
    task.dependencies.iter().all(|dep| {
        by_id
            .get(dep.as_str())
            .is_some_and(|d| d.status == TaskStatus::Completed)
    })
}

/// Validates dependency graphs and promotes tasks whose prerequisites are done.
#[derive(Clone)]
pub struct DependencyResolver {
    tasks: TaskStore,
}

impl DependencyResolver {
    pub fn new(tasks: TaskStore) -> Self {
        Self { tasks }
    }

    /// Cycle check over the given ids and everything they reach.
    pub async fn validate_dependencies(&self, task_ids: &[String]) -> Result<DependencyValidation> {
        let snapshot = self.tasks.list_tasks().await?;
        let graph = graph_of(&snapshot);
        Ok(match find_cycle(&graph, task_ids) {
            Some(cycle) => {
                warn!(cycle = ?cycle, "Dependency cycle detected");
                DependencyValidation::cyclic(cycle)
            }
            None => DependencyValidation::valid(),
        })
    }

    /// Cycle check for a task that has not been written yet.
    ///
    /// The candidate joins the current graph under `id`; an id that is
    /// already taken is reported valid and left for the create to refuse.
    pub async fn validate_new_task(
        &self,
        id: Option<&str>,
        dependencies: &[String],
    ) -> Result<DependencyValidation> {
        let snapshot = self.tasks.list_tasks().await?;
        let mut graph = graph_of(&snapshot);
        // Nothing can depend on a generated id yet, so the empty node stands in for it.
        let node = id.unwrap_or_default().to_string();
        if graph.contains_key(&node) {
            return Ok(DependencyValidation::valid());
        }
        graph.insert(node.clone(), dependencies.to_vec());
        Ok(match find_cycle(&graph, std::slice::from_ref(&node)) {
            Some(cycle) => {
                warn!(cycle = ?cycle, "Dependency cycle detected");
                DependencyValidation::cyclic(cycle)
            }
            None => DependencyValidation::valid(),
        })
    }

    /// Promote every BLOCKED task whose dependencies are all COMPLETED.
    ///
    /// Safe to run from many processes at once: a task that changed under us
    /// is counted as a conflict and left for the next pass.
    pub async fn update_task_statuses(&self) -> Result<ResolverPass> {
        let snapshot = self.tasks.list_tasks().await?;
        let by_id: HashMap<&str, &Task> = snapshot.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut pass = ResolverPass::default();

        for task in snapshot.iter().filter(|t| t.status == TaskStatus::Blocked) {
            pass.examined += 1;
            if !dependencies_met(task, &by_id) {
                continue;
            }
            let result = self.tasks.promote_task(&task.id, task.version).await;
            if result.success {
                info!(task_id = %task.id, "Dependencies met, task is now pending");
                pass.promoted.push(task.id.clone());
            } else {
                debug!(task_id = %task.id, code = ?result.error_code, "Skipped promotion");
                pass.conflicts += 1;
            }
        }

        Ok(pass)
    }

    /// Tasks available for claiming.
    pub async fn get_ready_tasks(&self) -> Result<Vec<Task>> {
        self.tasks.get_tasks_by_status(TaskStatus::Pending).await
    }

    /// Run [`Self::update_task_statuses`] on a fixed interval.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.update_task_statuses().await {
                    warn!(error = %e, "Resolver pass failed");
                }
            }
        })
    }
}
