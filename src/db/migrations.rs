//! Ordered schema migrations for the SQLite backend.
//!
//! Each migration is identified by a globally unique timestamp
//! (`YYYYMMDDHHMMSS`) and applied in its own transaction. Applied migrations are
//! recorded in the `migrations` table together with when they ran and how long
//! they took, so a database opened by a newer binary only runs what is missing.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

/// A single schema migration.
#[derive(Clone, Copy)]
pub struct Migration {
    /// Unique ordering key, e.g. `20250301090000`.
    pub timestamp: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("timestamp", &self.timestamp)
            .field("name", &self.name)
            .finish()
    }
}

/// A row of the `migrations` table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AppliedMigration {
    pub timestamp: i64,
    pub name: String,
    pub executed_at: i64,
    /// Wall-clock duration in milliseconds.
    pub execution_time: i64,
}

/// Error type for migration bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Two migrations share a timestamp.
    DuplicateTimestamp { timestamp: i64, names: (String, String) },
    /// The database records a migration this binary does not know.
    UnknownApplied { timestamp: i64, name: String },
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::DuplicateTimestamp { timestamp, names } => write!(
                f,
                "Migrations '{}' and '{}' share timestamp {}",
                names.0, names.1, timestamp
            ),
            MigrationError::UnknownApplied { timestamp, name } => write!(
                f,
                "Database has migration {} ('{}') which this build does not know; refusing to continue",
                timestamp, name
            ),
        }
    }
}

impl std::error::Error for MigrationError {}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        timestamp: 20250301090000,
        name: "create_tasks",
        sql: "CREATE TABLE tasks (
                  id           TEXT PRIMARY KEY,
                  parent_id    TEXT,
                  title        TEXT NOT NULL,
                  description  TEXT NOT NULL DEFAULT '',
                  status       TEXT NOT NULL,
                  version      INTEGER NOT NULL DEFAULT 0,
                  assigned_to  TEXT,
                  created_by   TEXT NOT NULL,
                  claimed_at   INTEGER,
                  completed_at INTEGER,
                  created_at   INTEGER NOT NULL,
                  updated_at   INTEGER NOT NULL,
                  metadata     TEXT NOT NULL DEFAULT '{}'
              );
              CREATE INDEX idx_tasks_status ON tasks(status);
              CREATE INDEX idx_tasks_assigned_to ON tasks(assigned_to);
              CREATE INDEX idx_tasks_parent_id ON tasks(parent_id);",
    },
    Migration {
        timestamp: 20250301090100,
        name: "create_task_dependencies",
        sql: "CREATE TABLE task_dependencies (
                  task_id       TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                  dependency_id TEXT NOT NULL,
                  PRIMARY KEY (task_id, dependency_id)
              );
              CREATE INDEX idx_task_dependencies_dependency ON task_dependencies(dependency_id);",
    },
    Migration {
        timestamp: 20250301090200,
        name: "create_agents",
        sql: "CREATE TABLE agents (
                  id             TEXT PRIMARY KEY,
                  pid            INTEGER NOT NULL,
                  start_time     INTEGER NOT NULL,
                  last_heartbeat INTEGER NOT NULL,
                  status         TEXT NOT NULL,
                  version        INTEGER NOT NULL DEFAULT 0
              );",
    },
    Migration {
        timestamp: 20250301090300,
        name: "create_registry_versions",
        sql: "CREATE TABLE registry_versions (
                  kind    TEXT PRIMARY KEY,
                  version INTEGER NOT NULL DEFAULT 0,
                  payload TEXT NOT NULL DEFAULT '{}'
              );",
    },
    Migration {
        timestamp: 20250301090400,
        name: "create_documents",
        sql: "CREATE TABLE documents (
                  key        TEXT PRIMARY KEY,
                  value      TEXT NOT NULL,
                  version    INTEGER NOT NULL DEFAULT 0,
                  updated_at INTEGER NOT NULL
              );",
    },
];

/// Reject migration lists with repeated timestamps.
pub fn validate_migrations(migrations: &[Migration]) -> std::result::Result<(), MigrationError> {
    let mut seen: HashSet<i64> = HashSet::new();
    for m in migrations {
        if !seen.insert(m.timestamp) {
            let first = migrations
                .iter()
                .find(|other| other.timestamp == m.timestamp)
                .map(|other| other.name)
                .unwrap_or_default();
            return Err(MigrationError::DuplicateTimestamp {
                timestamp: m.timestamp,
                names: (first.to_string(), m.name.to_string()),
            });
        }
    }
    Ok(())
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
             timestamp      INTEGER PRIMARY KEY,
             name           TEXT NOT NULL,
             executed_at    INTEGER NOT NULL,
             execution_time INTEGER NOT NULL
         );",
    )?;
    Ok(())
}

/// List applied migrations, oldest first.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    ensure_migrations_table(conn)?;
    let mut stmt = conn.prepare(
        "SELECT timestamp, name, executed_at, execution_time FROM migrations ORDER BY timestamp",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AppliedMigration {
                timestamp: row.get(0)?,
                name: row.get(1)?,
                executed_at: row.get(2)?,
                execution_time: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Apply every migration not yet recorded. Returns what was applied now.
pub fn run_migrations(
    conn: &mut Connection,
    migrations: &[Migration],
) -> Result<Vec<AppliedMigration>> {
    validate_migrations(migrations)?;
    ensure_migrations_table(conn)?;

    let known: HashSet<i64> = migrations.iter().map(|m| m.timestamp).collect();
    for applied in applied_migrations(conn)? {
        if !known.contains(&applied.timestamp) {
            return Err(MigrationError::UnknownApplied {
                timestamp: applied.timestamp,
                name: applied.name,
            }
            .into());
        }
    }

    let mut ordered: Vec<&Migration> = migrations.iter().collect();
    ordered.sort_by_key(|m| m.timestamp);

    let mut newly_applied = Vec::new();
    for m in ordered {
        let tx = conn.transaction()?;
        let done: Option<i64> = tx
            .query_row(
                "SELECT timestamp FROM migrations WHERE timestamp = ?1",
                params![m.timestamp],
                |row| row.get(0),
            )
            .optional()?;
        if done.is_some() {
            continue;
        }

        let started = Instant::now();
        tx.execute_batch(m.sql)?;
        let record = AppliedMigration {
            timestamp: m.timestamp,
            name: m.name.to_string(),
            executed_at: super::now_ms(),
            execution_time: started.elapsed().as_millis() as i64,
        };
        tx.execute(
            "INSERT INTO migrations (timestamp, name, executed_at, execution_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.timestamp,
                &record.name,
                record.executed_at,
                record.execution_time
            ],
        )?;
        tx.commit()?;
        newly_applied.push(record);
    }

    Ok(newly_applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_migrations_have_unique_timestamps() {
        assert!(validate_migrations(MIGRATIONS).is_ok());
    }

    #[test]
    fn duplicate_timestamps_rejected() {
        let list = [
            Migration { timestamp: 1, name: "a", sql: "" },
            Migration { timestamp: 1, name: "b", sql: "" },
        ];
        let err = validate_migrations(&list).unwrap_err();
        assert_eq!(
            err,
            MigrationError::DuplicateTimestamp {
                timestamp: 1,
                names: ("a".into(), "b".into())
            }
        );
    }

    #[test]
    fn migrations_apply_once_in_order() {
        let mut conn = Connection::open_in_memory().unwrap();
        let list = [
            Migration { timestamp: 20, name: "second", sql: "ALTER TABLE t ADD COLUMN b INTEGER;" },
            Migration { timestamp: 10, name: "first", sql: "CREATE TABLE t (a INTEGER);" },
        ];

        let applied = run_migrations(&mut conn, &list).unwrap();
        assert_eq!(
            applied.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );

        let again = run_migrations(&mut conn, &list).unwrap();
        assert!(again.is_empty());

        let recorded = applied_migrations(&conn).unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|m| m.executed_at > 0 && m.execution_time >= 0));
    }

    #[test]
    fn failed_migration_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        let list = [
            Migration { timestamp: 1, name: "ok", sql: "CREATE TABLE t (a INTEGER);" },
            Migration { timestamp: 2, name: "broken", sql: "CREATE TABLE u (a INTEGER); NOT SQL;" },
        ];

        assert!(run_migrations(&mut conn, &list).is_err());
        let recorded = applied_migrations(&conn).unwrap();
        assert_eq!(recorded.len(), 1);
        let u_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'u'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(u_exists, 0);
    }

    #[test]
    fn unknown_applied_migration_is_an_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        let newer = [Migration { timestamp: 5, name: "future", sql: "CREATE TABLE f (a INTEGER);" }];
        run_migrations(&mut conn, &newer).unwrap();

        let older: [Migration; 0] = [];
        assert!(run_migrations(&mut conn, &older).is_err());
    }
}
