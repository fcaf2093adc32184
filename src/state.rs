//! Persisted per-job status.
//!
//! The state file is only ever used to bias auto-detection recovery after a
//! plugin restart; it never resurrects jobs. Writes are atomic at file
//! granularity: a snapshot is rendered to a temporary file in the target
//! directory and moved into place.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::build::{JobStatus, PrevState, Saver};
use crate::confgroup::Config;

/// Name of the snapshot file inside the lib directory.
pub const STATE_FILE: &str = "harvest-jobs-statuses.json";

/// How often the snapshot is written.
const SAVE_EVERY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed state file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Two-level `module → name → status` map behind a mutex.
#[derive(Debug, Default)]
pub struct Store {
    items: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl Store {
    /// Read a snapshot from disk. A missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Store, StateError> {
        let content = match std::fs::read(path.as_ref()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Store::default());
            }
            Err(e) => return Err(e.into()),
        };
        let items = serde_json::from_slice(&content)?;
        Ok(Store {
            items: Mutex::new(items),
        })
    }

    pub fn set(&self, config: &Config, status: JobStatus) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items
            .entry(config.module().to_string())
            .or_default()
            .insert(config.name().to_string(), status.to_string());
    }

    pub fn remove(&self, config: &Config) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(names) = items.get_mut(config.module()) {
            names.remove(config.name());
            if names.is_empty() {
                items.remove(config.module());
            }
        }
    }

    pub fn lookup(&self, config: &Config) -> Option<String> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.get(config.module())?.get(config.name()).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    fn to_pretty_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_vec_pretty(&*items)
    }
}

impl Saver for Store {
    fn save(&self, config: &Config, status: JobStatus) {
        self.set(config, status);
    }

    fn remove(&self, config: &Config) {
        Store::remove(self, config);
    }
}

impl PrevState for Store {
    fn contains(&self, config: &Config, statuses: &[JobStatus]) -> bool {
        match self.lookup(config) {
            Some(current) => statuses.iter().any(|s| s.to_string() == current),
            None => false,
        }
    }
}

/// Periodically snapshots the store to disk.
pub struct Manager {
    path: PathBuf,
    store: Arc<Store>,
}

impl Manager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Manager {
            path: dir.as_ref().join(STATE_FILE),
            store: Arc::new(Store::default()),
        }
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save loop: one snapshot every 10 seconds plus a final one on
    /// cancellation. Saves are totally ordered, there is a single writer.
    pub async fn run(&self, token: CancellationToken) {
        info!("instance started");
        let mut interval = tokio::time::interval(SAVE_EVERY);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.save(),
            }
        }
        self.save();
        info!("instance stopped");
    }

    /// Atomically replace the state file with the current snapshot.
    /// Failures are logged and the snapshot dropped; the next tick retries.
    fn save(&self) {
        let bytes = match self.store.to_pretty_json() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "serializing state failed");
                return;
            }
        };
        if let Err(e) = write_atomically(&self.path, &bytes) {
            warn!(error = %e, path = %self.path.display(), "writing state file failed");
            return;
        }
        debug!(path = %self.path.display(), "state saved");
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
