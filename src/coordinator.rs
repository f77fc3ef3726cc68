//! Explicit wiring of the store, registry, engine and control loops.

use crate::agents::AgentRegistry;
use crate::config::{Config, StoreBackend, StoreConfig};
use crate::history::ExecutionHistory;
use crate::recovery::RecoverySweeper;
use crate::store::{FileStore, SqliteStore, Store};
use crate::tasks::{DependencyResolver, TaskStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Open the configured store backend.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    let path = config.effective_path();
    let store: Arc<dyn Store> = match config.backend {
        StoreBackend::File => Arc::new(
            FileStore::open(&path, config.file_options())
                .with_context(|| format!("opening file store at {}", path.display()))?,
        ),
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(&path, config.poll_interval())
                .with_context(|| format!("opening sqlite store at {}", path.display()))?,
        ),
    };
    info!(backend = ?config.backend, path = %path.display(), "Opened store");
    Ok(store)
}

/// All coordination components over one shared store.
pub struct Coordinator {
    config: Config,
    store: Arc<dyn Store>,
    tasks: TaskStore,
    resolver: DependencyResolver,
    agents: Arc<AgentRegistry>,
    sweeper: RecoverySweeper,
    history: ExecutionHistory,
}

impl Coordinator {
    pub fn open(config: &Config) -> Result<Self> {
        let store = open_store(&config.store)?;
        Ok(Self::with_store(store, config))
    }

    pub fn with_store(store: Arc<dyn Store>, config: &Config) -> Self {
        let tasks = TaskStore::with_retry(Arc::clone(&store), config.claims.retry_policy());
        let agents = Arc::new(AgentRegistry::new(
            Arc::clone(&store),
            config.agents.registry_options(),
        ));
        let resolver = DependencyResolver::new(tasks.clone());
        let sweeper = RecoverySweeper::new(tasks.clone(), Arc::clone(&agents));
        let history = ExecutionHistory::new(Arc::clone(&store), config.history.max_entries);
        Self {
            config: config.clone(),
            store,
            tasks,
            resolver,
            agents,
            sweeper,
            history,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn sweeper(&self) -> &RecoverySweeper {
        &self.sweeper
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Start the resolver timer and the recovery sweeper as configured.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let mut handles = Vec::new();
        if self.config.resolver.interval_ms > 0 {
            handles.push(
                self.resolver
                    .clone()
                    .spawn(Duration::from_millis(self.config.resolver.interval_ms)),
            );
        }
        if self.config.recovery.enabled {
            handles.push(
                self.sweeper
                    .clone()
                    .spawn(Duration::from_millis(self.config.recovery.interval_ms.max(1))),
            );
        }
        BackgroundTasks { handles }
    }
}

/// Running control loops. Dropping stops them.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}
