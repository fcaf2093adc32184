//! Run manager: holds active jobs and drives them with the shared tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::build::Runner;
use crate::job::Job;
use crate::ticker::Ticker;

struct JobHandle {
    full_name: String,
    tick_tx: mpsc::Sender<i64>,
    busy: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl JobHandle {
    /// Non-blocking tick delivery: dropped when the previous run has not
    /// finished yet.
    fn tick(&self, clock: i64) {
        if self.busy.load(Ordering::SeqCst) {
            debug!(job = %self.full_name, "skipping tick, previous run has not finished");
            return;
        }
        if self.tick_tx.try_send(clock).is_err() {
            debug!(job = %self.full_name, "skipping tick, previous tick is still queued");
        }
    }

    /// Synchronous stop: closing the tick channel ends the job loop; the
    /// await returns only after the module's cleanup has run.
    async fn stop(self) {
        drop(self.tick_tx);
        let _ = self.join.await;
    }
}

/// Holds the ordered job queue and broadcasts one tick per second.
pub struct Manager {
    queue: Mutex<Vec<JobHandle>>,
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Manager {
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Tick loop; returns when cancelled. Jobs are stopped separately via
    /// [`Manager::cleanup`].
    pub async fn run(&self, token: CancellationToken) {
        info!("instance started");
        let mut ticker = Ticker::new(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                clock = ticker.tick() => self.notify(clock).await,
            }
        }
        info!("instance stopped");
    }

    /// Broadcast a clock value to every job in the queue.
    pub async fn notify(&self, clock: i64) {
        for handle in self.queue.lock().await.iter() {
            handle.tick(clock);
        }
    }

    /// Spawn the job's loop and append it to the queue.
    pub async fn start(&self, job: Job) {
        let full_name = job.full_name().to_string();
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(job.main_loop(tick_rx, busy.clone()));

        self.queue.lock().await.push(JobHandle {
            full_name,
            tick_tx,
            busy,
            join,
        });
    }

    /// Remove the named job from the queue and stop it, waiting for its
    /// cleanup to finish.
    pub async fn stop(&self, full_name: &str) {
        let handle = {
            let mut queue = self.queue.lock().await;
            match queue.iter().position(|h| h.full_name == full_name) {
                Some(idx) => queue.remove(idx),
                None => return,
            }
        };
        handle.stop().await;
    }

    /// Stop every job in the queue.
    pub async fn cleanup(&self) {
        let handles: Vec<JobHandle> = self.queue.lock().await.drain(..).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait::async_trait]
impl Runner for Manager {
    async fn start(&self, job: Job) {
        Manager::start(self, job).await;
    }

    async fn stop(&self, full_name: &str) {
        Manager::stop(self, full_name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiwriter::shared_output;
    use crate::job::JobConfig;
    use crate::module::mock::MockModule;
    use std::sync::atomic::AtomicUsize;

    fn job(name: &str, module: MockModule) -> Job {
        Job::new(
            Box::new(module),
            JobConfig {
                plugin_name: "harvest".to_string(),
                name: name.to_string(),
                module_name: "mock".to_string(),
                full_name: format!("mock_{}", name),
                update_every: 1,
                auto_detect_every: 0,
                priority: 70000,
                out: shared_output(std::io::sink()),
            },
        )
    }

    #[tokio::test]
    async fn test_start_stop() {
        let manager = Manager::new();
        let module = MockModule::default();
        let cleanup = module.cleanup_count.clone();
        let mut j = job("a", module);
        assert!(j.auto_detection());

        manager.start(j).await;
        assert_eq!(manager.len().await, 1);

        manager.stop("mock_a").await;
        assert_eq!(manager.len().await, 0);
        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let manager = Manager::new();
        manager.stop("missing").await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn test_notify_reaches_jobs() {
        let manager = Manager::new();
        let collects = Arc::new(AtomicUsize::new(0));
        let counter = collects.clone();
        let module = MockModule::with_collect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(std::collections::HashMap::from([("value".to_string(), 1)]))
        });
        let mut j = job("b", module);
        assert!(j.auto_detection());
        manager.start(j).await;

        manager.notify(0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collects.load(Ordering::SeqCst), 1);

        manager.cleanup().await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tick_dropped_while_busy() {
        let manager = Manager::new();
        let collects = Arc::new(AtomicUsize::new(0));
        let counter = collects.clone();
        let module = MockModule::with_collect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            Some(std::collections::HashMap::from([("value".to_string(), 1)]))
        });
        let mut j = job("c", module);
        assert!(j.auto_detection());
        manager.start(j).await;

        manager.notify(0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The job is mid-collect; these ticks must be dropped.
        manager.notify(1).await;
        manager.notify(2).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(collects.load(Ordering::SeqCst), 1);
        manager.cleanup().await;
    }
}
