//! Relational store backend on SQLite.
//!
//! Keys are routed by namespace: `tasks/<id>` to task rows plus the
//! `task_dependencies` edge table, `agents/<id>` to agent rows, `meta/<kind>` to
//! the one-row-per-registry `registry_versions` table, anything else to
//! `documents`. Conditional writes run inside `BEGIN IMMEDIATE` so the version
//! check and the write are atomic across processes sharing the file.

use super::watch::{WatchCallback, WatchHandle, WatchHub};
use super::{AGENT_PREFIX, META_PREFIX, Store, StoreResult, TASK_PREFIX, validate_key, version_of};
use crate::db::{self, Database};
use crate::error::StoreError;
use crate::types::{Agent, Task};
use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{Connection, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace<'a> {
    Task(&'a str),
    Agent(&'a str),
    Registry(&'a str),
    Document,
}

fn namespace(key: &str) -> Namespace<'_> {
    let single = |rest: &str| !rest.contains('/');
    if let Some(id) = key.strip_prefix(TASK_PREFIX)
        && single(id)
    {
        Namespace::Task(id)
    } else if let Some(id) = key.strip_prefix(AGENT_PREFIX)
        && single(id)
    {
        Namespace::Agent(id)
    } else if let Some(kind) = key.strip_prefix(META_PREFIX)
        && single(kind)
    {
        Namespace::Registry(kind)
    } else {
        Namespace::Document
    }
}

/// A decoded value ready to be written to its table.
enum Record {
    Task(Task),
    Agent(Agent),
    Registry(Value),
    Document(Value),
}

impl Record {
    fn decode(key: &str, value: &Value) -> StoreResult<Self> {
        let invalid = |reason: String| StoreError::InvalidValue {
            key: key.to_string(),
            reason,
        };
        match namespace(key) {
            Namespace::Task(id) => {
                let task: Task =
                    serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;
                if task.id != id {
                    return Err(invalid(format!("record id '{}' does not match key", task.id)));
                }
                Ok(Record::Task(task))
            }
            Namespace::Agent(id) => {
                let agent: Agent =
                    serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;
                if agent.id != id {
                    return Err(invalid(format!("record id '{}' does not match key", agent.id)));
                }
                Ok(Record::Agent(agent))
            }
            Namespace::Registry(_) => Ok(Record::Registry(value.clone())),
            Namespace::Document => Ok(Record::Document(value.clone())),
        }
    }

    fn put(&self, conn: &Connection, key: &str) -> Result<()> {
        match (self, namespace(key)) {
            (Record::Task(task), _) => db::tasks::upsert_task(conn, task),
            (Record::Agent(agent), _) => db::agents::upsert_agent(conn, agent),
            (Record::Registry(value), Namespace::Registry(kind)) => {
                db::documents::put_registry(conn, kind, value, version_of(value))
            }
            (Record::Registry(value) | Record::Document(value), _) => {
                db::documents::put_document(conn, key, value, version_of(value))
            }
        }
    }
}

fn read_key(conn: &Connection, key: &str) -> Result<Option<Value>> {
    match namespace(key) {
        Namespace::Task(id) => db::tasks::get_task(conn, id)?
            .map(serde_json::to_value)
            .transpose()
            .map_err(Into::into),
        Namespace::Agent(id) => db::agents::get_agent(conn, id)?
            .map(serde_json::to_value)
            .transpose()
            .map_err(Into::into),
        Namespace::Registry(kind) => db::documents::get_registry(conn, kind),
        Namespace::Document => db::documents::get_document(conn, key),
    }
}

fn stored_version(conn: &Connection, key: &str) -> Result<Option<u64>> {
    match namespace(key) {
        Namespace::Task(id) => db::tasks::get_task_version(conn, id),
        Namespace::Agent(id) => db::agents::get_agent_version(conn, id),
        Namespace::Registry(kind) => db::documents::get_registry_version(conn, kind),
        Namespace::Document => db::documents::get_document_version(conn, key),
    }
}

fn delete_key(conn: &Connection, key: &str) -> Result<()> {
    match namespace(key) {
        Namespace::Task(id) => db::tasks::delete_task(conn, id),
        Namespace::Agent(id) => db::agents::delete_agent(conn, id),
        Namespace::Registry(kind) => db::documents::delete_registry(conn, kind),
        Namespace::Document => db::documents::delete_document(conn, key),
    }
}

fn all_keys(conn: &Connection) -> Result<Vec<String>> {
    let mut keys: Vec<String> = Vec::new();
    keys.extend(
        db::tasks::list_task_ids(conn)?
            .into_iter()
            .map(|id| format!("{}{}", TASK_PREFIX, id)),
    );
    keys.extend(
        db::agents::list_agent_ids(conn)?
            .into_iter()
            .map(|id| format!("{}{}", AGENT_PREFIX, id)),
    );
    keys.extend(
        db::documents::list_registry_kinds(conn)?
            .into_iter()
            .map(|kind| format!("{}{}", META_PREFIX, kind)),
    );
    keys.extend(db::documents::list_document_keys(conn)?);
    Ok(keys)
}

/// SQLite-backed store.
pub struct SqliteStore {
    db: Database,
    poll_interval: Duration,
    hub: Arc<WatchHub>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, poll_interval: Duration) -> StoreResult<Self> {
        Ok(Self::from_database(Database::open(path)?, poll_interval))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_database(
            Database::open_in_memory()?,
            Duration::from_millis(1_000),
        ))
    }

    pub fn from_database(db: Database, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval,
            hub: WatchHub::new(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        validate_key(key)?;
        Ok(self.db.with_conn(|conn| read_key(conn, key))?)
    }

    async fn write(&self, key: &str, value: &Value) -> StoreResult<()> {
        validate_key(key)?;
        let record = Record::decode(key, value)?;
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            record.put(&tx, key)?;
            tx.commit()?;
            Ok(())
        })?;
        self.hub.publish(key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            delete_key(&tx, key)?;
            tx.commit()?;
            Ok(())
        })?;
        self.hub.publish(key, None);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.read(key).await?.is_some())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = self.db.with_conn(all_keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn write_if_version(
        &self,
        key: &str,
        value: &Value,
        expected_version: u64,
    ) -> StoreResult<bool> {
        validate_key(key)?;
        let record = Record::decode(key, value)?;
        let written = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let matches = match stored_version(&tx, key)? {
                Some(current) => current == expected_version,
                None => expected_version == 0,
            };
            if !matches {
                return Ok(false);
            }
            record.put(&tx, key)?;
            tx.commit()?;
            Ok(true)
        })?;
        if written {
            self.hub.publish(key, Some(value));
        } else {
            tracing::debug!(key, expected_version, "CAS rejected: version moved");
        }
        Ok(written)
    }

    fn watch(&self, key: &str, on_change: WatchCallback) -> StoreResult<WatchHandle> {
        validate_key(key)?;
        let initial = self.db.with_conn(|conn| read_key(conn, key))?;
        let db = self.db.clone();
        let owned_key = key.to_string();
        let reader = Box::new(move || db.with_conn(|conn| read_key(conn, &owned_key)));
        Ok(self
            .hub
            .subscribe(key, initial.as_ref(), on_change, reader, self.poll_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_route_to_namespaces() {
        assert_eq!(namespace("tasks/abc"), Namespace::Task("abc"));
        assert_eq!(namespace("agents/agent-1"), Namespace::Agent("agent-1"));
        assert_eq!(namespace("meta/agents"), Namespace::Registry("agents"));
        assert_eq!(namespace("history/agent-1"), Namespace::Document);
        assert_eq!(namespace("tasks/a/b"), Namespace::Document);
    }

    #[tokio::test]
    async fn task_key_requires_task_shape() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.write("tasks/x", &json!({"title": "no status"})).await;
        assert!(matches!(result, Err(StoreError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn registry_rows_are_versioned() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(
            store
                .write_if_version("meta/agents", &json!({"version": 1, "next_id": 2}), 0)
                .await
                .unwrap()
        );
        assert!(
            !store
                .write_if_version("meta/agents", &json!({"version": 1, "next_id": 3}), 0)
                .await
                .unwrap()
        );
        let version = store
            .database()
            .with_conn(|conn| db::documents::get_registry_version(conn, "agents"))
            .unwrap();
        assert_eq!(version, Some(1));
    }
}
