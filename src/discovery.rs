//! Discovery manager: fans in discoverers and coalesces their updates.
//!
//! Every discoverer pushes group batches into a shared cache keyed by
//! source. The manager forwards snapshots downstream: the first send blocks
//! until the consumer accepts it, afterwards at most one snapshot per second
//! leaves via a non-blocking send. Bursts coalesce: the build manager sees
//! one batch per second no matter how many files changed at once.

pub mod file;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::confgroup::Group;

const SEND_EVERY: Duration = Duration::from_secs(1);

/// A source of configuration groups.
#[async_trait]
pub trait Discoverer: Send + Sync + 'static {
    /// Produce group batches on `out` until cancelled. Finite discoverers
    /// drop the sender when done.
    async fn run(&self, token: CancellationToken, out: mpsc::Sender<Vec<Group>>);
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no discoverers registered")]
    NoDiscoverers,
}

#[derive(Default)]
struct Coalesced {
    cache: HashMap<String, Group>,
    pending: bool,
}

impl Coalesced {
    fn update(&mut self, groups: Vec<Group>) {
        for group in groups {
            self.cache.insert(group.source.clone(), group);
        }
        self.pending = true;
    }

    fn snapshot(&self) -> Vec<Group> {
        self.cache.values().cloned().collect()
    }

    fn drain(&mut self) -> Vec<Group> {
        self.pending = false;
        self.cache.drain().map(|(_, group)| group).collect()
    }
}

pub struct Manager {
    discoverers: Vec<Arc<dyn Discoverer>>,
    state: Mutex<Coalesced>,
    updated: Notify,
}

impl Manager {
    pub fn new(discoverers: Vec<Arc<dyn Discoverer>>) -> Result<Self, DiscoveryError> {
        if discoverers.is_empty() {
            return Err(DiscoveryError::NoDiscoverers);
        }
        Ok(Manager {
            discoverers,
            state: Mutex::new(Coalesced::default()),
            updated: Notify::new(),
        })
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken, out: mpsc::Sender<Vec<Group>>) {
        info!("instance started");

        let mut fan_in = Vec::new();
        for discoverer in &self.discoverers {
            let (tx, rx) = mpsc::channel(1);
            let runner = discoverer.clone();
            let runner_token = token.clone();
            tokio::spawn(async move { runner.run(runner_token, tx).await });
            fan_in.push(tokio::spawn(self.clone().ingest(token.clone(), rx)));
        }

        self.send_loop(&token, out).await;

        for task in fan_in {
            let _ = task.await;
        }
        info!("instance stopped");
    }

    async fn ingest(
        self: Arc<Self>,
        token: CancellationToken,
        mut updates: mpsc::Receiver<Vec<Group>>,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                maybe_groups = updates.recv() => {
                    let Some(groups) = maybe_groups else { return };
                    self.lock_state().update(groups);
                    self.updated.notify_one();
                }
            }
        }
    }

    async fn send_loop(&self, token: &CancellationToken, out: mpsc::Sender<Vec<Group>>) {
        // Initial snapshot: wait for the first update, then block until the
        // consumer takes it.
        tokio::select! {
            _ = token.cancelled() => return,
            _ = self.updated.notified() => {}
        }
        let snapshot = self.lock_state().drain();
        tokio::select! {
            _ = token.cancelled() => return,
            result = out.send(snapshot) => {
                if result.is_err() {
                    return;
                }
            }
        }

        let mut interval = tokio::time::interval(SEND_EVERY);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {
                    let mut state = self.lock_state();
                    if !state.pending {
                        continue;
                    }
                    match out.try_send(state.snapshot()) {
                        Ok(()) => {
                            state.drain();
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("consumer is busy, will retry next tick");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Coalesced> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
