//! Caches backing the build manager.
//!
//! All three live inside the build event loop or the diff task and need no
//! locking.

use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::confgroup::{Config, Group};

/// Diffs successive group snapshots per source and globally.
///
/// The global index is reference-counted by fingerprint: a configuration
/// present in several sources counts once globally, and losing it from one
/// source while another still holds it silently migrates ownership instead
/// of removing it.
#[derive(Debug, Default)]
pub(crate) struct GroupCache {
    global: HashMap<u64, usize>,
    source: HashMap<String, HashMap<u64, Config>>,
}

impl GroupCache {
    pub(crate) fn new() -> Self {
        GroupCache::default()
    }

    /// Apply a group snapshot, returning the configurations that became
    /// globally visible and those that vanished globally.
    pub(crate) fn put(&mut self, group: &Group) -> (Vec<Config>, Vec<Config>) {
        let mut incoming: HashMap<u64, Config> = HashMap::new();
        for config in &group.configs {
            incoming.entry(config.fingerprint()).or_insert_with(|| config.clone());
        }

        let current = self.source.remove(&group.source).unwrap_or_default();

        let mut added = Vec::new();
        for (fingerprint, config) in &incoming {
            if current.contains_key(fingerprint) {
                continue;
            }
            let refs = self.global.entry(*fingerprint).or_insert(0);
            *refs += 1;
            if *refs == 1 {
                added.push(config.clone());
            }
        }

        let mut removed = Vec::new();
        for (fingerprint, config) in current {
            if incoming.contains_key(&fingerprint) {
                continue;
            }
            if let Some(refs) = self.global.get_mut(&fingerprint) {
                *refs -= 1;
                if *refs == 0 {
                    self.global.remove(&fingerprint);
                    removed.push(config);
                }
            }
        }

        if !incoming.is_empty() {
            self.source.insert(group.source.clone(), incoming);
        }

        (added, removed)
    }

    #[cfg(test)]
    pub(crate) fn global_len(&self) -> usize {
        self.global.len()
    }

    #[cfg(test)]
    pub(crate) fn source_len(&self) -> usize {
        self.source.len()
    }
}

/// Full names of jobs currently handed to the run manager.
#[derive(Debug, Default)]
pub(crate) struct StartedCache(HashSet<String>);

impl StartedCache {
    pub(crate) fn has(&self, config: &Config) -> bool {
        self.0.contains(&config.full_name())
    }

    pub(crate) fn put(&mut self, config: &Config) {
        self.0.insert(config.full_name());
    }

    pub(crate) fn remove(&mut self, config: &Config) {
        self.0.remove(&config.full_name());
    }

    pub(crate) fn drain(&mut self) -> Vec<String> {
        self.0.drain().collect()
    }
}

/// Cancellation handles for pending retries, keyed by config fingerprint.
#[derive(Debug, Default)]
pub(crate) struct RetryCache(HashMap<u64, CancellationToken>);

impl RetryCache {
    pub(crate) fn put(&mut self, config: &Config, token: CancellationToken) {
        self.0.insert(config.fingerprint(), token);
    }

    pub(crate) fn take(&mut self, config: &Config) -> Option<CancellationToken> {
        self.0.remove(&config.fingerprint())
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, token) in self.0.drain() {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}
