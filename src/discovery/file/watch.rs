//! Long-lived file watcher discoverer.
//!
//! Watches the directories containing each glob (files come and go, their
//! directories do not) and rescans on filesystem events plus a periodic
//! refresh tick. Modification times decide what actually changed: a changed
//! file emits a fresh group superseding the previous one, a vanished file
//! emits an empty group.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::confgroup::{Group, Registry};
use crate::discovery::Discoverer;
use crate::discovery::file::{PROVIDER_WATCHER, parse};

const REFRESH_EVERY: Duration = Duration::from_secs(60);
/// Editors commonly rename-then-write; give the write a moment to land.
const RENAME_DEBOUNCE: Duration = Duration::from_millis(100);

pub struct Watcher {
    registry: Registry,
    paths: Vec<String>,
}

/// Mutable scan state: the files last seen and their modification times.
#[derive(Default)]
struct ScanState {
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl Watcher {
    pub fn new(registry: Registry, paths: Vec<String>) -> Self {
        Watcher { registry, paths }
    }

    /// Directories to register with the notify backend: the parent of every
    /// glob pattern, not the matched files themselves.
    fn watch_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for pattern in &self.paths {
            let dir = Path::new(pattern)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }

    /// Rescan all globs against the recorded modification times.
    ///
    /// Returns one group per new or changed file and an empty group per
    /// vanished file.
    fn scan(&self, state: &mut ScanState) -> Vec<Group> {
        let mut groups = Vec::new();
        let mut seen = HashSet::new();

        for pattern in &self.paths {
            let matches = match glob::glob(pattern) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "bad path pattern");
                    continue;
                }
            };

            for path in matches.flatten() {
                if !path.is_file() {
                    continue;
                }
                seen.insert(path.clone());

                let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                let changed = match (state.mtimes.get(&path), mtime) {
                    (Some(prev), Some(cur)) => *prev != cur,
                    (None, _) => true,
                    (Some(_), None) => true,
                };
                if !changed {
                    continue;
                }
                if let Some(mtime) = mtime {
                    state.mtimes.insert(path.clone(), mtime);
                }

                match parse::parse_file(&self.registry, &path) {
                    Ok(Some(mut group)) => {
                        for config in &mut group.configs {
                            config.set_provider(PROVIDER_WATCHER);
                        }
                        groups.push(group);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "parsing file failed");
                    }
                }
            }
        }

        let vanished: Vec<PathBuf> = state
            .mtimes
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();
        for path in vanished {
            state.mtimes.remove(&path);
            groups.push(Group {
                source: path.display().to_string(),
                configs: Vec::new(),
            });
        }

        groups
    }
}

#[async_trait]
impl Discoverer for Watcher {
    async fn run(&self, token: CancellationToken, out: mpsc::Sender<Vec<Group>>) {
        let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<notify::Event>>(256);
        let mut watcher = match RecommendedWatcher::new(
            move |result| {
                let _ = event_tx.try_send(result);
            },
            notify::Config::default(),
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!(error = %e, "creating filesystem watcher failed");
                return;
            }
        };

        let mut watched: HashSet<PathBuf> = HashSet::new();
        watch_dirs(&mut watcher, &self.watch_dirs(), &mut watched);

        let mut state = ScanState::default();
        if !send_groups(&token, &out, self.scan(&mut state)).await {
            return;
        }

        let mut refresh = tokio::time::interval(REFRESH_EVERY);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await; // consume the immediate tick

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = refresh.tick() => {
                    // Directories may have appeared since the last attempt.
                    watch_dirs(&mut watcher, &self.watch_dirs(), &mut watched);
                    if !send_groups(&token, &out, self.scan(&mut state)).await {
                        return;
                    }
                }
                Some(result) = event_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "filesystem watcher error");
                            continue;
                        }
                    };
                    if is_chmod(&event) {
                        continue;
                    }
                    if is_rename(&event) {
                        tokio::time::sleep(RENAME_DEBOUNCE).await;
                    }
                    debug!(kind = ?event.kind, "filesystem event, rescanning");
                    if !send_groups(&token, &out, self.scan(&mut state)).await {
                        return;
                    }
                }
            }
        }
    }
}

fn watch_dirs(
    watcher: &mut RecommendedWatcher,
    dirs: &[PathBuf],
    watched: &mut HashSet<PathBuf>,
) {
    for dir in dirs {
        if watched.contains(dir) {
            continue;
        }
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                watched.insert(dir.clone());
            }
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "watching directory failed");
            }
        }
    }
}

async fn send_groups(
    token: &CancellationToken,
    out: &mpsc::Sender<Vec<Group>>,
    groups: Vec<Group>,
) -> bool {
    if groups.is_empty() {
        return true;
    }
    tokio::select! {
        _ = token.cancelled() => false,
        result = out.send(groups) => result.is_ok(),
    }
}

fn is_chmod(event: &notify::Event) -> bool {
    matches!(
        event.kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

fn is_rename(event: &notify::Event) -> bool {
    matches!(event.kind, EventKind::Modify(ModifyKind::Name(_)))
}
