//! Cross-plugin job uniqueness via advisory file locks.
//!
//! Every plugin of the monitoring agent tries to lock
//! `<dir>/<full_name>.lock` before starting a job; whoever holds the lock
//! serves the job, everyone else records it as a global duplicate.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use fs2::FileExt;
use thiserror::Error;

const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// File-lock backed registry of started job names.
#[derive(Debug)]
pub struct FileLockRegistry {
    dir: PathBuf,
    locks: Mutex<HashMap<String, File>>,
}

impl FileLockRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLockRegistry {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Try to claim `name`.
    ///
    /// `Ok(true)` when the lock is acquired (or already held by us),
    /// `Ok(false)` when another process holds it.
    pub fn register(&self, name: &str) -> Result<bool, RegistryError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.contains_key(name) {
            return Ok(true);
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}{}", name, LOCK_SUFFIX));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                locks.insert(name.to_string(), file);
                Ok(true)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release `name`; unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = locks.remove(name) {
            let _ = file.unlock();
        }
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
