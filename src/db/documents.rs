//! Generic JSON documents and per-registry version rows.

use super::now_ms;
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::warn;

fn parse_json(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "Ignoring malformed document");
            None
        }
    }
}

pub fn get_document(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM documents WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|raw| parse_json(key, &raw)))
}

pub fn get_document_version(conn: &Connection, key: &str) -> Result<Option<u64>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM documents WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v.max(0) as u64))
}

pub fn put_document(conn: &Connection, key: &str, value: &Value, version: u64) -> Result<()> {
    let version = i64::try_from(version).map_err(|_| anyhow!("document version overflow"))?;
    conn.execute(
        "INSERT INTO documents (key, value, version, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             version = excluded.version,
             updated_at = excluded.updated_at",
        params![key, value.to_string(), version, now_ms()],
    )?;
    Ok(())
}

pub fn delete_document(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM documents WHERE key = ?1", params![key])?;
    Ok(())
}

pub fn list_document_keys(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT key FROM documents ORDER BY key")?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(keys)
}

/// The `meta/<kind>` record of a registry. The version column mirrors the
/// payload's `version` field.
pub fn get_registry(conn: &Connection, kind: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT payload FROM registry_versions WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|raw| parse_json(kind, &raw)))
}

pub fn get_registry_version(conn: &Connection, kind: &str) -> Result<Option<u64>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM registry_versions WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v.max(0) as u64))
}

pub fn put_registry(conn: &Connection, kind: &str, payload: &Value, version: u64) -> Result<()> {
    let version = i64::try_from(version).map_err(|_| anyhow!("registry version overflow"))?;
    conn.execute(
        "INSERT INTO registry_versions (kind, version, payload) VALUES (?1, ?2, ?3)
         ON CONFLICT(kind) DO UPDATE SET
             version = excluded.version,
             payload = excluded.payload",
        params![kind, version, payload.to_string()],
    )?;
    Ok(())
}

pub fn delete_registry(conn: &Connection, kind: &str) -> Result<()> {
    conn.execute("DELETE FROM registry_versions WHERE kind = ?1", params![kind])?;
    Ok(())
}

pub fn list_registry_kinds(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT kind FROM registry_versions ORDER BY kind")?;
    let kinds = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(kinds)
}
