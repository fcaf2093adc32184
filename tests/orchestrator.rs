//! End-to-end orchestrator scenarios: groups in, protocol lines out.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use harvest::apiwriter::SharedOutput;
use harvest::build;
use harvest::confgroup::{Config, Group};
use harvest::module::mock::MockModule;
use harvest::module::{Creator, Registry};
use harvest::registry::FileLockRegistry;
use harvest::run;
use harvest::state::Store;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn shared(buf: SharedBuf) -> SharedOutput {
    Arc::new(Mutex::new(Box::new(buf)))
}

struct Orchestrator {
    out: SharedBuf,
    store: Arc<Store>,
    run_manager: Arc<run::Manager>,
    groups_tx: mpsc::Sender<Vec<Group>>,
    token: CancellationToken,
    build_task: tokio::task::JoinHandle<()>,
    _lock_dir: tempfile::TempDir,
}

impl Orchestrator {
    fn start(modules: Registry, prev_state: Arc<Store>) -> Self {
        let out = SharedBuf::default();
        let store = Arc::new(Store::default());
        let run_manager = Arc::new(run::Manager::new());
        let lock_dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(FileLockRegistry::new(lock_dir.path()));

        let build_manager = build::Manager::new(build::ManagerConfig {
            plugin_name: "harvest".to_string(),
            out: shared(out.clone()),
            modules: Arc::new(modules),
            runner: run_manager.clone(),
            saver: store.clone(),
            prev_state,
            locks,
        });

        let (groups_tx, groups_rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let build_task = tokio::spawn(build_manager.run(token.clone(), groups_rx));

        Orchestrator {
            out,
            store,
            run_manager,
            groups_tx,
            token,
            build_task,
            _lock_dir: lock_dir,
        }
    }

    async fn deliver(&self, source: &str, configs: Vec<Config>) {
        self.groups_tx
            .send(vec![Group {
                source: source.to_string(),
                configs,
            }])
            .await
            .unwrap();
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    /// Drive the clock range through the run manager's broadcast.
    async fn ticks(&self, clocks: std::ops::Range<i64>) {
        for clock in clocks {
            self.run_manager.notify(clock).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn shutdown(self) -> SharedBuf {
        self.token.cancel();
        self.build_task.await.unwrap();
        self.run_manager.cleanup().await;
        self.out
    }
}

fn cfg(module: &str, name: &str, update_every: i64) -> Config {
    let mut config = Config::default();
    config.set("module", module);
    config.set("name", name);
    config.set("update_every", update_every);
    config
}

fn registry_of(
    entries: Vec<(&str, Box<dyn Fn() -> MockModule + Send + Sync>)>,
) -> Registry {
    let mut registry = Registry::default();
    for (name, make) in entries {
        registry.register(
            name,
            Creator::new(Box::new(move |_| Ok(Box::new(make())))),
        );
    }
    registry
}

#[tokio::test(start_paused = true)]
async fn healthy_add_then_remove() {
    let cleanup_count = Arc::new(AtomicUsize::new(0));
    let counter = cleanup_count.clone();
    let orchestrator = Orchestrator::start(
        registry_of(vec![(
            "mock",
            Box::new(move || MockModule {
                cleanup_count: counter.clone(),
                ..MockModule::default()
            }),
        )]),
        Arc::new(Store::default()),
    );

    let config = cfg("mock", "j", 2);
    orchestrator.deliver("a.yml", vec![config.clone()]).await;
    orchestrator.settle().await;

    assert_eq!(
        orchestrator.store.lookup(&config).as_deref(),
        Some("success")
    );
    assert_eq!(orchestrator.run_manager.len().await, 1);

    // First due tick produces the chart with the job's update interval.
    orchestrator.ticks(0..1).await;
    let out = orchestrator.out.contents();
    assert_eq!(out.matches("CHART 'mock_j.mock'").count(), 1, "out: {}", out);
    assert!(out.contains("'2'"), "out: {}", out);
    assert!(out.contains("SET value = 1"), "out: {}", out);

    // The source dropping the config stops the job and obsoletes its chart.
    orchestrator.deliver("a.yml", vec![]).await;
    orchestrator.settle().await;

    assert!(orchestrator.store.is_empty());
    assert_eq!(orchestrator.run_manager.len().await, 0);
    assert_eq!(cleanup_count.load(Ordering::SeqCst), 1);

    let out = orchestrator.out.contents();
    assert!(out.contains("'obsolete'"), "out: {}", out);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_full_name_across_sources() {
    let orchestrator = Orchestrator::start(
        registry_of(vec![("mock", Box::new(MockModule::default))]),
        Arc::new(Store::default()),
    );

    orchestrator
        .deliver("a.yml", vec![cfg("mock", "j", 1)])
        .await;
    // Same module and name, different parameters: same full name, new
    // fingerprint.
    orchestrator
        .deliver("b.yml", vec![cfg("mock", "j", 5)])
        .await;
    orchestrator.settle().await;

    assert_eq!(orchestrator.run_manager.len().await, 1);
    assert_eq!(
        orchestrator.store.lookup(&cfg("mock", "j", 5)).as_deref(),
        Some("duplicate_local")
    );

    orchestrator.ticks(0..1).await;
    let out = orchestrator.out.contents();
    assert_eq!(out.matches("CHART 'mock_j.mock'").count(), 1, "out: {}", out);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failure_retries_until_success() {
    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    let orchestrator = Orchestrator::start(
        registry_of(vec![(
            "mock",
            Box::new(move || {
                let calls = counter.clone();
                MockModule::with_check(move || calls.fetch_add(1, Ordering::SeqCst) >= 3)
            }),
        )]),
        Arc::new(Store::default()),
    );

    let mut config = cfg("mock", "j", 1);
    config.set("autodetection_retry", 1);
    orchestrator.deliver("a.yml", vec![config.clone()]).await;
    orchestrator.settle().await;

    assert_eq!(orchestrator.store.lookup(&config).as_deref(), Some("retry"));
    assert_eq!(orchestrator.run_manager.len().await, 0);

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(1100)).await;
    }

    assert_eq!(
        orchestrator.store.lookup(&config).as_deref(),
        Some("success")
    );
    assert_eq!(orchestrator.run_manager.len().await, 1);

    orchestrator.ticks(0..1).await;
    let out = orchestrator.out.contents();
    assert_eq!(out.matches("CHART 'mock_j.mock'").count(), 1, "out: {}", out);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn previously_healthy_job_gets_recovery_bias() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("harvest-jobs-statuses.json");
    std::fs::write(&state_path, "{\n \"mock\": {\n  \"j\": \"success\"\n }\n}").unwrap();
    let prev_state = Arc::new(Store::load(&state_path).unwrap());

    let orchestrator = Orchestrator::start(
        registry_of(vec![(
            "mock",
            Box::new(|| MockModule::with_check(|| false)),
        )]),
        prev_state,
    );

    // autodetection_retry is 0; without the bias the job would be failed.
    let config = cfg("mock", "j", 1);
    orchestrator.deliver("a.yml", vec![config.clone()]).await;
    orchestrator.settle().await;

    assert_eq!(orchestrator.store.lookup(&config).as_deref(), Some("retry"));

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_collects_grow_the_run_interval() {
    let collects = Arc::new(AtomicUsize::new(0));
    let counter = collects.clone();
    let orchestrator = Orchestrator::start(
        registry_of(vec![(
            "mock",
            Box::new(move || {
                let calls = counter.clone();
                MockModule::with_collect(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Some(HashMap::new())
                })
            }),
        )]),
        Arc::new(Store::default()),
    );

    orchestrator
        .deliver("a.yml", vec![cfg("mock", "j", 1)])
        .await;
    orchestrator.settle().await;

    // Dry runs at t = 0..4 push retries to 5, penalty to 2: from then on
    // the job only runs on every third second.
    orchestrator.ticks(0..12).await;

    let runs = collects.load(Ordering::SeqCst);
    assert_eq!(runs, 7, "expected runs at t = 0,1,2,3,4,6,9");

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_retries_and_jobs() {
    const LIVE: usize = 4;
    const RETRYING: usize = 6;

    let cleanup_count = Arc::new(AtomicUsize::new(0));
    let detections = Arc::new(AtomicUsize::new(0));

    let cleanups = cleanup_count.clone();
    let attempts = detections.clone();
    let orchestrator = Orchestrator::start(
        registry_of(vec![
            (
                "mock",
                Box::new(move || MockModule {
                    cleanup_count: cleanups.clone(),
                    ..MockModule::default()
                }),
            ),
            (
                "flaky",
                Box::new(move || {
                    let calls = attempts.clone();
                    MockModule::with_check(move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        false
                    })
                }),
            ),
        ]),
        Arc::new(Store::default()),
    );

    let mut configs: Vec<Config> = (0..LIVE)
        .map(|i| cfg("mock", &format!("live{}", i), 1))
        .collect();
    for i in 0..RETRYING {
        let mut config = cfg("flaky", &format!("retry{}", i), 1);
        config.set("autodetection_retry", 30);
        configs.push(config);
    }

    orchestrator.deliver("a.yml", configs.clone()).await;
    orchestrator.settle().await;

    assert_eq!(orchestrator.run_manager.len().await, LIVE);
    for config in &configs[LIVE..] {
        assert_eq!(orchestrator.store.lookup(config).as_deref(), Some("retry"));
    }
    let attempts_before = detections.load(Ordering::SeqCst);
    assert_eq!(attempts_before, RETRYING);

    // Create the charts so shutdown has something to obsolete.
    orchestrator.ticks(0..1).await;

    let out = orchestrator.shutdown().await;

    // Every live job cleaned up exactly once, each of its two charts (data
    // plus execution time) obsoleted exactly once.
    assert_eq!(cleanup_count.load(Ordering::SeqCst), LIVE);
    assert_eq!(out.contents().matches("'obsolete'").count(), LIVE * 2);

    // Cancelled retry timers stay silent.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(detections.load(Ordering::SeqCst), attempts_before);
}
