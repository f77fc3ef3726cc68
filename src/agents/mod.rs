//! Agent registry: identity, heartbeats and liveness.
//!
//! Each process registers once as an agent. A background heartbeat keeps its
//! `agents/<id>` record fresh; any reader treats an agent whose heartbeat is
//! older than the offline threshold as offline, whatever the stored status
//! says. `meta/agents` holds the id counter and doubles as the roster change
//! marker that [`AgentRegistry::subscribe`] watches.

use crate::db::now_ms;
use crate::store::{
    AGENT_PREFIX, Store, StoreResult, WatchCallback, WatchHandle, agent_key, is_valid_segment,
    meta_key, version_of,
};
use crate::types::{Agent, AgentInfo, AgentStatus};
use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3_000);
pub const DEFAULT_OFFLINE_THRESHOLD_MS: i64 = 10_000;

const ROSTER_KIND: &str = "agents";
const ROSTER_CAS_ATTEMPTS: u32 = 10;

/// Callback receiving the online agents after a roster change.
pub type RosterCallback = Arc<dyn Fn(Vec<Agent>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct AgentRegistryOptions {
    pub heartbeat_interval: Duration,
    pub offline_threshold_ms: i64,
}

impl Default for AgentRegistryOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            offline_threshold_ms: DEFAULT_OFFLINE_THRESHOLD_MS,
        }
    }
}

/// The registration held by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    agent_id: String,
    pid: u32,
    start_time: i64,
}

impl Session {
    fn owns(&self, agent: &Agent) -> bool {
        agent.pid == self.pid && agent.start_time == self.start_time
    }
}

pub struct AgentRegistry {
    store: Arc<dyn Store>,
    options: AgentRegistryOptions,
    session: Mutex<Option<Session>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, options: AgentRegistryOptions) -> Self {
        Self {
            store,
            options,
            session: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn offline_threshold_ms(&self) -> i64 {
        self.options.offline_threshold_ms
    }

    pub fn current_agent_id(&self) -> Option<String> {
        self.session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.agent_id.clone()))
    }

    fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    /// Register this process, optionally under a chosen id, and start heartbeats.
    pub async fn register(&self, custom_id: Option<&str>) -> Result<Agent> {
        if let Some(existing) = self.current_agent_id() {
            bail!("This process is already registered as {}", existing);
        }

        let agent_id = match custom_id {
            Some(id) if !is_valid_segment(id) => bail!("Invalid agent id '{}'", id),
            Some(id) => id.to_string(),
            None => self.allocate_id().await?,
        };

        let key = agent_key(&agent_id);
        let now = now_ms();
        let previous = self.get_agent(&agent_id).await?;
        if let Some(prev) = &previous
            && prev.is_live(now, self.options.offline_threshold_ms)
        {
            bail!(
                "Agent id {} is held by a live session (pid {}, last heartbeat {} ms ago)",
                agent_id,
                prev.pid,
                now - prev.last_heartbeat
            );
        }

        let expected = previous.as_ref().map(|a| a.version).unwrap_or(0);
        let agent = Agent {
            id: agent_id.clone(),
            pid: std::process::id(),
            start_time: now,
            last_heartbeat: now,
            status: AgentStatus::Online,
            version: expected + 1,
        };
        if !self
            .store
            .write_if_version(&key, &serde_json::to_value(&agent)?, expected)
            .await?
        {
            bail!("Agent id {} was registered concurrently", agent_id);
        }

        let session = Session {
            agent_id: agent_id.clone(),
            pid: agent.pid,
            start_time: agent.start_time,
        };
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session.clone());
        }
        self.start_heartbeat(session);
        self.touch_roster().await?;

        info!(agent_id = %agent.id, pid = agent.pid, "Registered agent");
        Ok(agent)
    }

    /// Mark this process's agent offline and stop heartbeats. No-op when not registered.
    pub async fn unregister(&self) -> Result<()> {
        self.stop_heartbeat();
        let session = match self.session.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(session) = session else {
            return Ok(());
        };

        let key = agent_key(&session.agent_id);
        for _ in 0..ROSTER_CAS_ATTEMPTS {
            let Some(agent) = self.get_agent(&session.agent_id).await? else {
                break;
            };
            if !session.owns(&agent) {
                debug!(agent_id = %session.agent_id, "Record belongs to a newer session, leaving it");
                break;
            }
            let offline = Agent {
                status: AgentStatus::Offline,
                version: agent.version + 1,
                ..agent.clone()
            };
            if self
                .store
                .write_if_version(&key, &serde_json::to_value(&offline)?, agent.version)
                .await?
            {
                break;
            }
        }

        self.touch_roster().await?;
        info!(agent_id = %session.agent_id, "Unregistered agent");
        Ok(())
    }

    /// Refresh this process's heartbeat once.
    pub async fn heartbeat(&self) -> Result<()> {
        let session = self
            .current_session()
            .ok_or_else(|| anyhow!("Not registered"))?;
        match beat(self.store.as_ref(), &session).await? {
            Beat::Stored | Beat::Conflict => Ok(()),
            Beat::Replaced => bail!("Agent {} was taken over by another session", session.agent_id),
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        read_agent(self.store.as_ref(), agent_id).await
    }

    /// All agent records with derived liveness.
    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        let now = now_ms();
        let threshold = self.options.offline_threshold_ms;
        Ok(all_agents(self.store.as_ref())
            .await?
            .into_iter()
            .map(|agent| AgentInfo {
                online: agent.is_live(now, threshold),
                heartbeat_age_ms: now - agent.last_heartbeat,
                agent,
            })
            .collect())
    }

    pub async fn get_online_agents(&self) -> Result<Vec<Agent>> {
        online_agents(self.store.as_ref(), self.options.offline_threshold_ms).await
    }

    /// Unknown agents count as offline.
    pub async fn is_agent_offline(&self, agent_id: &str) -> Result<bool> {
        let now = now_ms();
        Ok(match self.get_agent(agent_id).await? {
            Some(agent) => !agent.is_live(now, self.options.offline_threshold_ms),
            None => true,
        })
    }

    /// Call `on_change` with the online agents whenever the roster changes.
    ///
    /// Best effort: heartbeat expiry alone does not trigger a notification.
    pub fn subscribe(&self, on_change: RosterCallback) -> StoreResult<WatchHandle> {
        let store = Arc::clone(&self.store);
        let threshold = self.options.offline_threshold_ms;
        let callback: WatchCallback = Arc::new(move |_| {
            let store = Arc::clone(&store);
            let on_change = Arc::clone(&on_change);
            tokio::spawn(async move {
                match online_agents(store.as_ref(), threshold).await {
                    Ok(agents) => on_change(agents),
                    Err(e) => debug!(error = %e, "Roster refresh failed"),
                }
            });
        });
        self.store.watch(&meta_key(ROSTER_KIND), callback)
    }

    /// Take the next `agent-{n}` id from the shared counter.
    async fn allocate_id(&self) -> Result<String> {
        let key = meta_key(ROSTER_KIND);
        for _ in 0..ROSTER_CAS_ATTEMPTS * 4 {
            let current = self.store.read(&key).await?.unwrap_or_else(|| json!({}));
            let version = version_of(&current);
            let n = current.get("next_id").and_then(Value::as_u64).unwrap_or(1);
            let next = json!({
                "version": version + 1,
                "next_id": n + 1,
                "changed_at": now_ms(),
            });
            if !self.store.write_if_version(&key, &next, version).await? {
                continue;
            }
            let candidate = format!("agent-{}", n);
            if self.store.exists(&agent_key(&candidate)).await? {
                // Taken by an explicit registration; draw again.
                continue;
            }
            return Ok(candidate);
        }
        bail!("Could not allocate an agent id: roster counter is contended")
    }

    /// Bump the roster change marker so watchers re-read the agent list.
    async fn touch_roster(&self) -> Result<()> {
        let key = meta_key(ROSTER_KIND);
        for _ in 0..ROSTER_CAS_ATTEMPTS {
            let mut current = self.store.read(&key).await?.unwrap_or_else(|| json!({}));
            let version = version_of(&current);
            if !current.is_object() {
                current = json!({});
            }
            current["version"] = json!(version + 1);
            current["changed_at"] = json!(now_ms());
            if current.get("next_id").is_none() {
                current["next_id"] = json!(1);
            }
            if self.store.write_if_version(&key, &current, version).await? {
                return Ok(());
            }
        }
        warn!("Roster change marker is contended; watchers may miss this change");
        Ok(())
    }

    fn start_heartbeat(&self, session: Session) {
        let store = Arc::clone(&self.store);
        let interval = self.options.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match beat(store.as_ref(), &session).await {
                    Ok(Beat::Stored) => {}
                    Ok(Beat::Conflict) => {
                        debug!(agent_id = %session.agent_id, "Heartbeat lost a race, retrying next tick");
                    }
                    Ok(Beat::Replaced) => {
                        warn!(agent_id = %session.agent_id, "Agent record taken over by another session; stopping heartbeat");
                        break;
                    }
                    Err(e) => warn!(agent_id = %session.agent_id, error = %e, "Heartbeat failed"),
                }
            }
        });
        if let Ok(mut slot) = self.heartbeat.lock()
            && let Some(old) = slot.replace(handle)
        {
            old.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Ok(mut slot) = self.heartbeat.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

impl Drop for AgentRegistry {
    fn drop(&mut self) {
        // The record is left online and goes stale after the offline threshold.
        self.stop_heartbeat();
    }
}

enum Beat {
    Stored,
    Conflict,
    Replaced,
}

async fn beat(store: &dyn Store, session: &Session) -> Result<Beat> {
    let Some(agent) = read_agent(store, &session.agent_id).await? else {
        return Ok(Beat::Replaced);
    };
    if !session.owns(&agent) {
        return Ok(Beat::Replaced);
    }
    let fresh = Agent {
        last_heartbeat: now_ms(),
        status: AgentStatus::Online,
        version: agent.version + 1,
        ..agent.clone()
    };
    let stored = store
        .write_if_version(
            &agent_key(&session.agent_id),
            &serde_json::to_value(&fresh)?,
            agent.version,
        )
        .await?;
    Ok(if stored { Beat::Stored } else { Beat::Conflict })
}

async fn read_agent(store: &dyn Store, agent_id: &str) -> Result<Option<Agent>> {
    if !is_valid_segment(agent_id) {
        return Ok(None);
    }
    let Some(value) = store.read(&agent_key(agent_id)).await? else {
        return Ok(None);
    };
    match serde_json::from_value::<Agent>(value) {
        Ok(agent) => Ok(Some(agent)),
        Err(e) => {
            warn!(agent_id, error = %e, "Ignoring malformed agent record");
            Ok(None)
        }
    }
}

async fn all_agents(store: &dyn Store) -> Result<Vec<Agent>> {
    let mut agents = Vec::new();
    for key in store.list(AGENT_PREFIX).await? {
        let id = key.trim_start_matches(AGENT_PREFIX);
        if let Some(agent) = read_agent(store, id).await? {
            agents.push(agent);
        }
    }
    Ok(agents)
}

async fn online_agents(store: &dyn Store, threshold_ms: i64) -> Result<Vec<Agent>> {
    let now = now_ms();
    let mut agents = all_agents(store).await?;
    agents.retain(|a| a.is_live(now, threshold_ms));
    Ok(agents)
}
