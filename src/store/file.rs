//! Flat-file store backend.
//!
//! Each key maps to `<base>/<key>.json`. Writes go through a sibling
//! `<key>.json.lock` file created with exclusive-create semantics, which acts as
//! the per-key mutex for [`Store::write_if_version`]. The lock is removed on
//! every exit path; a lock older than `stale_lock` is assumed to belong to a
//! crashed process and is broken.
//!
//! Every lock file carries a unique owner token. Breaking a stale lock first
//! renames it to a private tombstone and only deletes the tombstone when it
//! still holds the token that was judged stale, so two breakers can never
//! both discard a live lock.

use super::watch::{WatchCallback, WatchHandle, WatchHub};
use super::{Store, StoreResult, validate_key, version_matches};
use crate::db::now_ms;
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

const LOCK_SUFFIX: &str = ".lock";
const DATA_SUFFIX: &str = ".json";

/// Tuning knobs for the flat-file backend.
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// How long to wait for a key lock before giving up.
    pub lock_timeout: Duration,
    /// Age after which an existing lock file is considered abandoned.
    pub stale_lock: Duration,
    /// Interval of the cross-process watch poller.
    pub poll_interval: Duration,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5_000),
            stale_lock: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(1_000),
        }
    }
}

/// Lock-file-protected flat-file store.
pub struct FileStore {
    base_dir: PathBuf,
    options: FileStoreOptions,
    hub: Arc<WatchHub>,
}

/// Removes the lock file when dropped, unless another process has taken it over.
struct KeyLock {
    path: PathBuf,
    token: String,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.token => {
                if let Err(e) = fs::remove_file(&self.path)
                    && e.kind() != ErrorKind::NotFound
                {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
                }
            }
            Ok(_) => warn!(path = %self.path.display(), "Lock was broken while held"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to read lock file"),
        }
    }
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `base_dir`.
    pub fn open<P: AsRef<Path>>(base_dir: P, options: FileStoreOptions) -> StoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            options,
            hub: WatchHub::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn data_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.base_dir.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        let mut os = path.into_os_string();
        os.push(DATA_SUFFIX);
        Ok(PathBuf::from(os))
    }

    fn lock_path(data_path: &Path) -> PathBuf {
        let mut os = data_path.as_os_str().to_owned();
        os.push(LOCK_SUFFIX);
        PathBuf::from(os)
    }

    /// Acquire the per-key lock, backing off between attempts.
    async fn lock(&self, key: &str, data_path: &Path) -> StoreResult<KeyLock> {
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = Self::lock_path(data_path);
        let token = format!("{} {} {}", std::process::id(), now_ms(), Uuid::now_v7());
        let deadline = Instant::now() + self.options.lock_timeout;
        let mut delay = Duration::from_millis(2);

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(token.as_bytes()) {
                        let _ = fs::remove_file(&lock_path);
                        return Err(e.into());
                    }
                    return Ok(KeyLock {
                        path: lock_path,
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale(&lock_path) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(key.to_string()));
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn stale_age(&self, path: &Path) -> Option<Duration> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .filter(|age| *age > self.options.stale_lock)
    }

    fn break_if_stale(&self, lock_path: &Path) -> bool {
        let Some(age) = self.stale_age(lock_path) else {
            return false;
        };
        let Ok(observed) = fs::read_to_string(lock_path) else {
            return false;
        };

        let mut tombstone = lock_path.as_os_str().to_owned();
        tombstone.push(format!(".{}.stale", Uuid::now_v7()));
        let tombstone = PathBuf::from(tombstone);
        if fs::rename(lock_path, &tombstone).is_err() {
            return false;
        }

        // A fresh lock may still be empty, so its age has to match too.
        let moved = fs::read_to_string(&tombstone).unwrap_or_default();
        if moved != observed || self.stale_age(&tombstone).is_none() {
            // Someone replaced the stale lock before the rename; hand theirs back.
            if let Err(e) = fs::hard_link(&tombstone, lock_path) {
                warn!(path = %lock_path.display(), error = %e, "Failed to restore live lock");
            }
            let _ = fs::remove_file(&tombstone);
            return false;
        }

        warn!(path = %lock_path.display(), age_ms = age.as_millis() as u64, "Breaking stale lock");
        if let Err(e) = fs::remove_file(&tombstone) {
            debug!(path = %tombstone.display(), error = %e, "Failed to remove lock tombstone");
        }
        true
    }

    /// Write via a temp file and rename so readers never see a partial document.
    fn write_atomic(data_path: &Path, value: &Value) -> StoreResult<()> {
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = data_path.as_os_str().to_owned();
        tmp.push(format!(".{}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, data_path)?;
        Ok(())
    }

    fn collect_keys(dir: &Path, rel: &str, out: &mut Vec<String>) -> std::io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let child = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                Self::collect_keys(&entry.path(), &child, out)?;
            } else if let Some(stem) = name.strip_suffix(DATA_SUFFIX) {
                if rel.is_empty() {
                    out.push(stem.to_string());
                } else {
                    out.push(format!("{}/{}", rel, stem));
                }
            }
        }
        Ok(())
    }
}

/// Read and parse a document; malformed content counts as absent.
fn read_document(path: &Path) -> StoreResult<Option<Value>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed document");
            Ok(None)
        }
    }
}

#[async_trait]
impl Store for FileStore {
    async fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        let path = self.data_path(key)?;
        read_document(&path)
    }

    async fn write(&self, key: &str, value: &Value) -> StoreResult<()> {
        let path = self.data_path(key)?;
        {
            let _lock = self.lock(key, &path).await?;
            Self::write_atomic(&path, value)?;
        }
        self.hub.publish(key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.data_path(key)?;
        {
            let _lock = self.lock(key, &path).await?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.hub.publish(key, None);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.read(key).await?.is_some())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        Self::collect_keys(&self.base_dir, "", &mut keys)?;
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
        let path = self.data_path(key)?;
        {
            let _lock = self.lock(key, &path).await?;
            let current = read_document(&path)?;
            if !version_matches(current.as_ref(), expected_version) {
                debug!(key, expected_version, "CAS rejected: version moved");
                return Ok(false);
            }
            Self::write_atomic(&path, value)?;
        }
        self.hub.publish(key, Some(value));
        Ok(true)
    }

    fn watch(&self, key: &str, on_change: WatchCallback) -> StoreResult<WatchHandle> {
        let path = self.data_path(key)?;
        let initial = read_document(&path)?;
        let reader_path = path.clone();
        let reader = Box::new(move || read_document(&reader_path).map_err(anyhow::Error::from));
        Ok(self.hub.subscribe(
            key,
            initial.as_ref(),
            on_change,
            reader,
            self.options.poll_interval,
        ))
    }
}
