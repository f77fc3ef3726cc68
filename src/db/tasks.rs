//! Task rows and their dependency edges.

use crate::types::{Task, TaskStatus};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Decode a task row. A row with an unknown status or unreadable metadata is
/// logged and yields `None`, so it reads as absent instead of as a fresh task.
pub fn parse_task_row(row: &Row) -> rusqlite::Result<Option<Task>> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let metadata_json: String = row.get("metadata")?;
    let version: i64 = row.get("version")?;

    let Some(status) = TaskStatus::parse(&status) else {
        warn!(task_id = %id, %status, "Ignoring task row with unknown status");
        return Ok(None);
    };
    let metadata = match serde_json::from_str::<HashMap<String, serde_json::Value>>(&metadata_json) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(task_id = %id, error = %e, "Ignoring task row with malformed metadata");
            return Ok(None);
        }
    };

    Ok(Some(Task {
        id,
        parent_id: row.get("parent_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status,
        version: version.max(0) as u64,
        assigned_to: row.get("assigned_to")?,
        created_by: row.get("created_by")?,
        dependencies: BTreeSet::new(),
        claimed_at: row.get("claimed_at")?,
        completed_at: row.get("completed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        metadata,
    }))
}

fn load_dependencies(conn: &Connection, task_id: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT dependency_id FROM task_dependencies WHERE task_id = ?1 ORDER BY dependency_id",
    )?;
    let deps = stmt
        .query_map(params![task_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(deps)
}

/// Get a task (with dependencies) using an existing connection.
pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![task_id],
            parse_task_row,
        )
        .optional()?
        .flatten();

    match task {
        Some(mut task) => {
            task.dependencies = load_dependencies(conn, task_id)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

/// Stored version of a task row, if present.
pub fn get_task_version(conn: &Connection, task_id: &str) -> Result<Option<u64>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v.max(0) as u64))
}

/// Insert or replace a task row and its dependency edges.
pub fn upsert_task(conn: &Connection, task: &Task) -> Result<()> {
    let metadata_json = serde_json::to_string(&task.metadata)?;
    let version = i64::try_from(task.version).map_err(|_| anyhow!("task version overflow"))?;

    conn.execute(
        "INSERT INTO tasks (
             id, parent_id, title, description, status, version, assigned_to, created_by,
             claimed_at, completed_at, created_at, updated_at, metadata
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
             parent_id = excluded.parent_id,
             title = excluded.title,
             description = excluded.description,
             status = excluded.status,
             version = excluded.version,
             assigned_to = excluded.assigned_to,
             created_by = excluded.created_by,
             claimed_at = excluded.claimed_at,
             completed_at = excluded.completed_at,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at,
             metadata = excluded.metadata",
        params![
            &task.id,
            &task.parent_id,
            &task.title,
            &task.description,
            task.status.as_str(),
            version,
            &task.assigned_to,
            &task.created_by,
            task.claimed_at,
            task.completed_at,
            task.created_at,
            task.updated_at,
            metadata_json,
        ],
    )?;

    conn.execute(
        "DELETE FROM task_dependencies WHERE task_id = ?1",
        params![&task.id],
    )?;
    for dep in &task.dependencies {
        conn.execute(
            "INSERT INTO task_dependencies (task_id, dependency_id) VALUES (?1, ?2)",
            params![&task.id, dep],
        )?;
    }

    Ok(())
}

pub fn delete_task(conn: &Connection, task_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM task_dependencies WHERE task_id = ?1",
        params![task_id],
    )?;
    conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
    Ok(())
}

pub fn list_task_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM tasks ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}
