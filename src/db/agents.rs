//! Agent rows.

use crate::types::{Agent, AgentStatus};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};

fn status_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Online => "online",
        AgentStatus::Offline => "offline",
    }
}

pub fn get_agent(conn: &Connection, agent_id: &str) -> Result<Option<Agent>> {
    let agent = conn
        .query_row(
            "SELECT id, pid, start_time, last_heartbeat, status, version
             FROM agents WHERE id = ?1",
            params![agent_id],
            |row| {
                let status: String = row.get(4)?;
                let pid: i64 = row.get(1)?;
                let version: i64 = row.get(5)?;
                Ok(Agent {
                    id: row.get(0)?,
                    pid: pid.max(0) as u32,
                    start_time: row.get(2)?,
                    last_heartbeat: row.get(3)?,
                    status: if status == "online" {
                        AgentStatus::Online
                    } else {
                        AgentStatus::Offline
                    },
                    version: version.max(0) as u64,
                })
            },
        )
        .optional()?;
    Ok(agent)
}

pub fn get_agent_version(conn: &Connection, agent_id: &str) -> Result<Option<u64>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM agents WHERE id = ?1",
            params![agent_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v.max(0) as u64))
}

pub fn upsert_agent(conn: &Connection, agent: &Agent) -> Result<()> {
    let version = i64::try_from(agent.version).map_err(|_| anyhow!("agent version overflow"))?;
    conn.execute(
        "INSERT INTO agents (id, pid, start_time, last_heartbeat, status, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             pid = excluded.pid,
             start_time = excluded.start_time,
             last_heartbeat = excluded.last_heartbeat,
             status = excluded.status,
             version = excluded.version",
        params![
            &agent.id,
            agent.pid as i64,
            agent.start_time,
            agent.last_heartbeat,
            status_str(agent.status),
            version,
        ],
    )?;
    Ok(())
}

pub fn delete_agent(conn: &Connection, agent_id: &str) -> Result<()> {
    conn.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])?;
    Ok(())
}

pub fn list_agent_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM agents ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}
