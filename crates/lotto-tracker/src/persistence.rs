//! Durable snapshot of tracked job identities.
//!
//! The stored list is only a hint for resuming polling after a restart;
//! nothing depends on reading it back successfully.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context;
use lotto_download::PersistedJob;

use crate::error::format_error_chain;
use crate::identity;

pub const STORAGE_KEY: &str = "lotto.activeDownloads.v1";

/// String values under string keys, in the spirit of browser local storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// One `<key>.json` file per key under `dir`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let map = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut map = self.values.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut map = self.values.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl Persistence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            key: STORAGE_KEY.to_string(),
        }
    }

    /// Best-effort: failures are logged, never returned.
    pub fn save(&self, jobs: &[PersistedJob]) {
        let json = match serde_json::to_string(jobs) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize tracked downloads");
                return;
            }
        };
        if let Err(err) = self.store.set(&self.key, &json) {
            tracing::warn!(
                error = %format_error_chain(&err),
                key = %self.key,
                "failed to persist tracked downloads"
            );
        }
    }

    /// Reads back the saved jobs. Corrupt data is cleared and treated as
    /// "nothing to resume".
    pub fn load(&self) -> Vec<PersistedJob> {
        let raw = match self.store.get(&self.key) {
            Ok(Some(v)) => v,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!(
                    error = %format_error_chain(&err),
                    key = %self.key,
                    "failed to read tracked downloads"
                );
                return Vec::new();
            }
        };

        let jobs = match serde_json::from_str::<Vec<PersistedJob>>(&raw) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, key = %self.key, "discarding corrupt tracked downloads");
                if let Err(err) = self.store.remove(&self.key) {
                    tracing::warn!(error = %format_error_chain(&err), "failed to clear corrupt state");
                }
                return Vec::new();
            }
        };

        jobs.into_iter().filter_map(normalize_job).collect()
    }
}

fn normalize_job(job: PersistedJob) -> Option<PersistedJob> {
    let primary_id = identity::normalize(job.primary_id.as_deref());
    let container_id = identity::normalize(job.container_id.as_deref());
    let key = identity::derive_key(primary_id.as_deref(), container_id.as_deref())?;
    Some(PersistedJob {
        key,
        primary_id,
        container_id,
        display_name: job.display_name.trim().to_string(),
    })
}
