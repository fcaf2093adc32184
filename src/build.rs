//! Build manager: turns configuration deltas into supervised jobs.
//!
//! One task diffs incoming group batches through the group cache and emits
//! ordered remove/add events; a second single-threaded event loop applies
//! them, runs auto-detection, schedules retries for transient failures and
//! owns both the per-plugin started-set and the cross-plugin lock registry.

mod cache;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::apiwriter::SharedOutput;
use crate::build::cache::{GroupCache, RetryCache, StartedCache};
use crate::confgroup::{Config, Group};
use crate::discovery::file;
use crate::job::{Job, JobConfig};
use crate::module::{self, ModuleError};
use crate::registry::RegistryError;

/// Outcome of handling one configuration, persisted by the state manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Auto-detection succeeded, the job is running.
    Success,
    /// Auto-detection failed but is worth retrying.
    Retry,
    /// Auto-detection failed for good.
    Failed,
    /// A job with the same full name is already started by this plugin.
    DuplicateLocal,
    /// A job with the same full name is registered by another plugin.
    DuplicateGlobal,
    /// Module lookup or instantiation failed.
    BuildError,
    /// Cross-plugin registration failed on resource exhaustion.
    RegistrationError,
}

/// Hands detected jobs to the run manager.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    async fn start(&self, job: Job);
    async fn stop(&self, full_name: &str);
}

/// Records the current status of every known configuration.
pub trait Saver: Send + Sync {
    fn save(&self, config: &Config, status: JobStatus);
    fn remove(&self, config: &Config);
}

/// Read-only view of the previous run's statuses.
pub trait PrevState: Send + Sync {
    fn contains(&self, config: &Config, statuses: &[JobStatus]) -> bool;
}

/// Cross-plugin uniqueness registry.
pub trait LockRegistry: Send + Sync {
    fn register(&self, name: &str) -> Result<bool, RegistryError>;
    fn unregister(&self, name: &str);
}

/// No-op state saver for wiring without persistence.
pub struct NoopSaver;

impl Saver for NoopSaver {
    fn save(&self, _config: &Config, _status: JobStatus) {}
    fn remove(&self, _config: &Config) {}
}

/// Previous state that remembers nothing.
pub struct NoopPrevState;

impl PrevState for NoopPrevState {
    fn contains(&self, _config: &Config, _statuses: &[JobStatus]) -> bool {
        false
    }
}

/// Lock registry that always grants.
pub struct NoopLockRegistry;

impl LockRegistry for NoopLockRegistry {
    fn register(&self, _name: &str) -> Result<bool, RegistryError> {
        Ok(true)
    }

    fn unregister(&self, _name: &str) {}
}

impl LockRegistry for crate::registry::FileLockRegistry {
    fn register(&self, name: &str) -> Result<bool, RegistryError> {
        crate::registry::FileLockRegistry::register(self, name)
    }

    fn unregister(&self, name: &str) {
        crate::registry::FileLockRegistry::unregister(self, name)
    }
}

/// Ordered output of the diff task. Removes always precede the adds of the
/// same group arrival; a single FIFO channel keeps that order end to end.
#[derive(Debug)]
enum DiffEvent {
    Remove(Vec<Config>),
    Add(Vec<Config>),
}

/// A retry carries the auto-detection budget left for the configuration so
/// the bounded recovery windows actually terminate.
#[derive(Debug)]
struct RetrySpec {
    config: Config,
    every: i64,
    tries: i64,
}

pub struct ManagerConfig {
    pub plugin_name: String,
    pub out: SharedOutput,
    pub modules: Arc<module::Registry>,
    pub runner: Arc<dyn Runner>,
    pub saver: Arc<dyn Saver>,
    pub prev_state: Arc<dyn PrevState>,
    pub locks: Arc<dyn LockRegistry>,
}

pub struct Manager {
    plugin_name: String,
    out: SharedOutput,
    modules: Arc<module::Registry>,
    runner: Arc<dyn Runner>,
    saver: Arc<dyn Saver>,
    prev_state: Arc<dyn PrevState>,
    locks: Arc<dyn LockRegistry>,
    started: StartedCache,
    retries: RetryCache,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Manager {
            plugin_name: config.plugin_name,
            out: config.out,
            modules: config.modules,
            runner: config.runner,
            saver: config.saver,
            prev_state: config.prev_state,
            locks: config.locks,
            started: StartedCache::default(),
            retries: RetryCache::default(),
        }
    }

    /// Consume group batches until cancelled, then cancel every pending
    /// retry, unregister every started name and stop every live job.
    pub async fn run(
        mut self,
        token: CancellationToken,
        groups_rx: mpsc::Receiver<Vec<Group>>,
    ) {
        info!("instance started");

        let (diff_tx, diff_rx) = mpsc::channel(1);
        let diff = tokio::spawn(diff_loop(token.clone(), groups_rx, diff_tx));

        self.event_loop(&token, diff_rx).await;
        self.cleanup().await;

        let _ = diff.await;
        info!("instance stopped");
    }

    async fn event_loop(&mut self, token: &CancellationToken, mut diff_rx: mpsc::Receiver<DiffEvent>) {
        let (retry_tx, mut retry_rx) = mpsc::channel(1);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                event = diff_rx.recv() => match event {
                    Some(DiffEvent::Remove(configs)) => self.handle_remove_batch(configs).await,
                    Some(DiffEvent::Add(configs)) => {
                        self.handle_add_batch(token, &retry_tx, configs).await;
                    }
                    None => return,
                },
                Some(retry) = retry_rx.recv() => {
                    self.handle_add(token, &retry_tx, retry.config, Some((retry.every, retry.tries)))
                        .await;
                }
            }
        }
    }

    async fn handle_remove_batch(&mut self, configs: Vec<Config>) {
        for config in configs {
            self.handle_remove(config).await;
        }
    }

    async fn handle_add_batch(
        &mut self,
        token: &CancellationToken,
        retry_tx: &mpsc::Sender<RetrySpec>,
        configs: Vec<Config>,
    ) {
        for config in configs {
            if token.is_cancelled() {
                return;
            }
            self.handle_add(token, retry_tx, config, None).await;
        }
    }

    async fn handle_remove(&mut self, config: Config) {
        if self.started.has(&config) {
            let full_name = config.full_name();
            self.runner.stop(&full_name).await;
            self.locks.unregister(&full_name);
            self.started.remove(&config);
        }
        if let Some(retry_token) = self.retries.take(&config) {
            retry_token.cancel();
        }
        self.saver.remove(&config);
    }

    async fn handle_add(
        &mut self,
        token: &CancellationToken,
        retry_tx: &mpsc::Sender<RetrySpec>,
        config: Config,
        retry_budget: Option<(i64, i64)>,
    ) {
        if self.started.has(&config) {
            info!(
                module = config.module(),
                job = config.name(),
                "already served by another job, skipping"
            );
            self.saver.save(&config, JobStatus::DuplicateLocal);
            return;
        }

        // A newly arrived config supersedes its own pending retry.
        let was_pending = match self.retries.take(&config) {
            Some(retry_token) => {
                retry_token.cancel();
                true
            }
            None => false,
        };

        let mut job = match self.build_job(&config) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    module = config.module(),
                    job = config.name(),
                    error = %e,
                    "building job failed"
                );
                self.saver.save(&config, JobStatus::BuildError);
                return;
            }
        };

        match retry_budget {
            Some((every, tries)) => {
                job.auto_detect_every = every;
                job.auto_detect_tries = tries;
            }
            None if !was_pending && config.auto_detection_retry() == 0 => {
                if self
                    .prev_state
                    .contains(&config, &[JobStatus::Success, JobStatus::Retry])
                {
                    // 5 minutes
                    job.auto_detect_every = 30;
                    job.auto_detect_tries = 11;
                } else if inside_k8s_cluster() && config.provider() == file::PROVIDER_WATCHER {
                    job.auto_detect_every = 10;
                    job.auto_detect_tries = 7;
                }
            }
            None => {}
        }

        if job.auto_detection() {
            self.register_and_start(&config, job).await;
        } else if job.retry_auto_detection() {
            info!(
                module = config.module(),
                job = config.name(),
                delay_secs = job.auto_detect_every,
                "detection failed, will retry"
            );
            self.saver.save(&config, JobStatus::Retry);
            let retry_token = token.child_token();
            self.retries.put(&config, retry_token.clone());
            let spec = RetrySpec {
                every: job.auto_detect_every,
                tries: job.auto_detect_tries,
                config,
            };
            tokio::spawn(retry_task(retry_token, retry_tx.clone(), spec));
        } else {
            self.saver.save(&config, JobStatus::Failed);
        }
    }

    async fn register_and_start(&mut self, config: &Config, job: Job) {
        let full_name = config.full_name();
        match self.locks.register(&full_name) {
            Ok(true) => {
                self.saver.save(config, JobStatus::Success);
                self.runner.start(job).await;
                self.started.put(config);
            }
            Ok(false) => {
                info!(
                    module = config.module(),
                    job = config.name(),
                    "already served by another plugin, skipping"
                );
                self.saver.save(config, JobStatus::DuplicateGlobal);
            }
            Err(e) if is_too_many_open_files(&e) => {
                error!(module = config.module(), job = config.name(), error = %e, "job registration failed");
                self.saver.save(config, JobStatus::RegistrationError);
            }
            Err(e) => {
                warn!(
                    module = config.module(),
                    job = config.name(),
                    error = %e,
                    "job registration failed, starting anyway"
                );
                self.saver.save(config, JobStatus::Success);
                self.runner.start(job).await;
                self.started.put(config);
            }
        }
    }

    fn build_job(&self, config: &Config) -> Result<Job, ModuleError> {
        let creator = self
            .modules
            .lookup(config.module())
            .ok_or_else(|| ModuleError::Unknown(config.module().to_string()))?;
        let module = (creator.create)(config)?;

        Ok(Job::new(
            module,
            JobConfig {
                plugin_name: self.plugin_name.clone(),
                name: config.name().to_string(),
                module_name: config.module().to_string(),
                full_name: config.full_name(),
                update_every: config.update_every(),
                auto_detect_every: config.auto_detection_retry(),
                priority: config.priority(),
                out: self.out.clone(),
            },
        ))
    }

    async fn cleanup(&mut self) {
        self.retries.cancel_all();
        for full_name in self.started.drain() {
            self.runner.stop(&full_name).await;
            self.locks.unregister(&full_name);
        }
    }
}

async fn diff_loop(
    token: CancellationToken,
    mut groups_rx: mpsc::Receiver<Vec<Group>>,
    diff_tx: mpsc::Sender<DiffEvent>,
) {
    let mut cache = GroupCache::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            maybe_groups = groups_rx.recv() => {
                let Some(groups) = maybe_groups else { return };
                for group in groups {
                    let (added, removed) = cache.put(&group);
                    if !removed.is_empty()
                        && !send_event(&token, &diff_tx, DiffEvent::Remove(removed)).await
                    {
                        return;
                    }
                    if !added.is_empty()
                        && !send_event(&token, &diff_tx, DiffEvent::Add(added)).await
                    {
                        return;
                    }
                }
            }
        }
    }
}

async fn send_event(
    token: &CancellationToken,
    diff_tx: &mpsc::Sender<DiffEvent>,
    event: DiffEvent,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        result = diff_tx.send(event) => result.is_ok(),
    }
}

/// Fires the configuration back onto the retry channel after its delay,
/// unless cancelled first. Cancellation between timer expiry and the send
/// still suppresses the send.
async fn retry_task(
    token: CancellationToken,
    retry_tx: mpsc::Sender<RetrySpec>,
    spec: RetrySpec,
) {
    let delay = Duration::from_secs(spec.every.max(1) as u64);
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = retry_tx.send(spec) => {}
            }
        }
    }
}

fn inside_k8s_cluster() -> bool {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").unwrap_or_default();
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_default();
    !host.is_empty() && !port.is_empty()
}

fn is_too_many_open_files(err: &RegistryError) -> bool {
    err.to_string().to_lowercase().contains("too many open files")
}
