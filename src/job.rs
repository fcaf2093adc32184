//! Job wrapper: owns one collector's lifecycle.
//!
//! A job drives its module through auto-detection (`init → check → charts`),
//! then runs `collect` on the shared one-second tick, renders metrics into a
//! private buffer and flushes complete `BEGIN … END` blocks to the shared
//! output stream. Repeated dry runs slow the job down via a penalty on its
//! effective update interval.

use std::collections::HashMap;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::apiwriter::{ApiWriter, SharedOutput};
use crate::module::Module;
use crate::module::charts::{Chart, Charts, Dim};

const PENALTY_STEP: i64 = 5;
const MAX_PENALTY: i64 = 600;
/// Retry auto-detection forever.
pub const INF_TRIES: i64 = -1;

/// Stable attributes of a job, resolved by the build manager.
pub struct JobConfig {
    pub plugin_name: String,
    pub name: String,
    pub module_name: String,
    pub full_name: String,
    pub update_every: i64,
    pub auto_detect_every: i64,
    pub priority: i64,
    pub out: SharedOutput,
}

pub struct Job {
    plugin_name: String,
    name: String,
    module_name: String,
    full_name: String,
    update_every: i64,

    pub auto_detect_every: i64,
    pub auto_detect_tries: i64,

    module: Box<dyn Module>,
    charts: Charts,
    runtime_chart: Chart,

    writer: ApiWriter<Vec<u8>>,
    out: SharedOutput,

    initialized: bool,
    panicked: bool,
    retries: i64,
    next_priority: i64,
    prev_run: Option<Instant>,
}

impl Job {
    pub fn new(module: Box<dyn Module>, config: JobConfig) -> Self {
        let runtime_chart = Chart {
            id: format!("execution_time_of_{}", config.full_name),
            type_id: config.plugin_name.clone(),
            title: format!("Execution Time for {}", config.full_name),
            units: "ms".to_string(),
            family: config.plugin_name.clone(),
            context: format!("{}.plugin_execution_time", config.plugin_name),
            priority: 145000,
            dims: vec![Dim::new("time")],
            ..Chart::default()
        };

        Job {
            plugin_name: config.plugin_name,
            name: config.name,
            module_name: config.module_name,
            full_name: config.full_name,
            update_every: config.update_every.max(1),
            auto_detect_every: config.auto_detect_every,
            auto_detect_tries: INF_TRIES,
            module,
            charts: Charts::new(),
            runtime_chart,
            writer: ApiWriter::new(Vec::new()),
            out: config.out,
            initialized: false,
            panicked: false,
            retries: 0,
            next_priority: config.priority,
            prev_run: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn update_every(&self) -> i64 {
        self.update_every
    }

    pub fn panicked(&self) -> bool {
        self.panicked
    }

    /// Run the `init → check → charts` preflight.
    ///
    /// A panic anywhere counts as failure, marks the job panicked and
    /// permanently disables auto-detection. On any failure the module's
    /// cleanup runs before returning.
    pub fn auto_detection(&mut self) -> bool {
        let ok = match panic::catch_unwind(AssertUnwindSafe(|| self.detect())) {
            Ok(ok) => ok,
            Err(payload) => {
                error!(job = %self.full_name, panic = panic_message(&payload), "auto-detection panicked");
                self.panicked = true;
                self.auto_detect_every = 0;
                false
            }
        };
        if !ok {
            let module = &mut self.module;
            if panic::catch_unwind(AssertUnwindSafe(|| module.cleanup())).is_err() {
                warn!(job = %self.full_name, "cleanup panicked");
            }
        }
        ok
    }

    /// Whether a failed check is still worth retrying.
    pub fn retry_auto_detection(&self) -> bool {
        self.auto_detect_every > 0
            && (self.auto_detect_tries == INF_TRIES || self.auto_detect_tries > 0)
    }

    fn detect(&mut self) -> bool {
        if !self.init() {
            error!(job = %self.full_name, "init failed");
            self.auto_detect_every = 0;
            return false;
        }
        if !self.check() {
            info!(job = %self.full_name, "check failed");
            return false;
        }
        if !self.post_check() {
            self.auto_detect_every = 0;
            return false;
        }
        true
    }

    fn init(&mut self) -> bool {
        if self.initialized {
            return true;
        }
        if self.module.init() {
            self.initialized = true;
        }
        self.initialized
    }

    fn check(&mut self) -> bool {
        let ok = self.module.check();
        if !ok && self.auto_detect_tries != INF_TRIES {
            self.auto_detect_tries -= 1;
        }
        ok
    }

    fn post_check(&mut self) -> bool {
        match self.module.charts() {
            Some(charts) => match charts.check() {
                Ok(()) => {
                    self.charts = charts;
                    true
                }
                Err(e) => {
                    error!(job = %self.full_name, error = %e, "charts check failed");
                    false
                }
            },
            None => {
                error!(job = %self.full_name, "charts are not set");
                false
            }
        }
    }

    /// Main loop: runs until the tick channel closes, then cleans up and
    /// marks every created chart obsolete. The `busy` flag guards the
    /// non-blocking tick broadcast: ticks arriving while a run is in
    /// progress are dropped, not queued.
    pub(crate) async fn main_loop(mut self, mut tick_rx: mpsc::Receiver<i64>, busy: Arc<AtomicBool>) {
        debug!(job = %self.full_name, "instance started");
        while let Some(clock) = tick_rx.recv().await {
            busy.store(true, Ordering::SeqCst);
            if clock % (self.update_every + self.penalty()) == 0 {
                self.run_once();
            }
            busy.store(false, Ordering::SeqCst);
            if self.panicked {
                error!(job = %self.full_name, "collector panicked, stopping the job");
                break;
            }
        }
        self.teardown();
        debug!(job = %self.full_name, "instance stopped");
    }

    fn penalty(&self) -> i64 {
        let penalty = self.retries / PENALTY_STEP * PENALTY_STEP * self.update_every / 2;
        penalty.min(MAX_PENALTY)
    }

    fn run_once(&mut self) {
        let start = Instant::now();
        let since_last_us = self
            .prev_run
            .map(|prev| start.duration_since(prev).as_micros() as i64)
            .unwrap_or(0);
        self.prev_run = Some(start);
        self.panicked = false;

        let module = &mut self.module;
        let metrics = match panic::catch_unwind(AssertUnwindSafe(|| module.collect())) {
            Ok(metrics) => metrics.unwrap_or_default(),
            Err(payload) => {
                error!(job = %self.full_name, panic = panic_message(&payload), "collect panicked");
                self.panicked = true;
                self.auto_detect_every = 0;
                self.writer.get_mut().clear();
                return;
            }
        };

        if self.process_metrics(&metrics, start, since_last_us) {
            self.retries = 0;
        } else {
            self.retries += 1;
        }
        self.flush();
    }

    fn process_metrics(
        &mut self,
        metrics: &HashMap<String, i64>,
        start: Instant,
        since_last_us: i64,
    ) -> bool {
        if !self.runtime_chart.created {
            let mut runtime_chart = std::mem::take(&mut self.runtime_chart);
            self.write_chart_def(&mut runtime_chart);
            self.runtime_chart = runtime_chart;
        }

        let mut charts = std::mem::take(&mut self.charts);
        let mut total_updated = 0;
        let mut removed = Vec::new();

        for chart in charts.iter_mut() {
            if chart.marked_remove {
                if chart.created {
                    chart.opts.obsolete = true;
                    self.write_chart_line(chart);
                }
                removed.push(chart.id.clone());
                continue;
            }
            if !chart.created {
                self.write_chart_def(chart);
            }
            if metrics.is_empty() || chart.opts.obsolete {
                continue;
            }
            if self.write_chart_update(chart, metrics, since_last_us) {
                total_updated += 1;
            }
        }
        for id in &removed {
            charts.remove(id);
        }
        self.charts = charts;

        if total_updated == 0 {
            return false;
        }

        let elapsed_ms = start.elapsed().as_millis() as i64;
        let mut runtime_chart = std::mem::take(&mut self.runtime_chart);
        let runtime = HashMap::from([("time".to_string(), elapsed_ms)]);
        self.write_chart_update(&mut runtime_chart, &runtime, since_last_us);
        self.runtime_chart = runtime_chart;

        true
    }

    fn write_chart_def(&mut self, chart: &mut Chart) {
        if chart.priority == 0 {
            chart.priority = self.next_priority;
            self.next_priority += 1;
        }
        self.write_chart_line(chart);
        for dim in &chart.dims {
            let _ = self
                .writer
                .dimension(&dim.id, &dim.name, dim.algo, dim.mul, dim.div, dim.hidden);
        }
        for var in &chart.vars {
            let _ = self.writer.var_set(&var.id, var.value);
        }
        let _ = self.writer.empty_line();
        chart.created = true;
    }

    fn write_chart_line(&mut self, chart: &Chart) {
        let type_id = if chart.type_id.is_empty() {
            self.full_name.as_str()
        } else {
            chart.type_id.as_str()
        };
        let _ = self.writer.chart(
            type_id,
            &chart.id,
            &chart.over_id,
            &chart.title,
            &chart.units,
            &chart.family,
            &chart.context,
            chart.chart_type,
            chart.priority,
            self.update_every,
            chart.opts,
            &self.plugin_name,
            &self.module_name,
        );
    }

    fn write_chart_update(
        &mut self,
        chart: &mut Chart,
        data: &HashMap<String, i64>,
        since_last_us: i64,
    ) -> bool {
        let since = if chart.updated { since_last_us } else { 0 };
        let type_id = if chart.type_id.is_empty() {
            self.full_name.as_str()
        } else {
            chart.type_id.as_str()
        };
        let _ = self.writer.begin(type_id, &chart.id, since);

        let mut updated = 0;
        for dim in &chart.dims {
            match data.get(&dim.id) {
                Some(value) => {
                    let _ = self.writer.dim_set(&dim.id, *value);
                    updated += 1;
                }
                None => {
                    let _ = self.writer.dim_set_empty(&dim.id);
                }
            }
        }
        for var in &chart.vars {
            if let Some(value) = data.get(&var.id) {
                let _ = self.writer.var_set(&var.id, *value);
            }
        }
        let _ = self.writer.end();

        chart.updated = updated > 0;
        chart.updated
    }

    fn teardown(&mut self) {
        let module = &mut self.module;
        if panic::catch_unwind(AssertUnwindSafe(|| module.cleanup())).is_err() {
            warn!(job = %self.full_name, "cleanup panicked");
        }

        let mut charts = std::mem::take(&mut self.charts);
        for chart in charts.iter_mut() {
            if !chart.created {
                continue;
            }
            chart.opts.obsolete = true;
            self.write_chart_line(chart);
        }
        let mut runtime_chart = std::mem::take(&mut self.runtime_chart);
        if runtime_chart.created {
            runtime_chart.opts.obsolete = true;
            self.write_chart_line(&runtime_chart);
        }
        self.runtime_chart = runtime_chart;
        self.flush();
    }

    fn flush(&mut self) {
        let buf = self.writer.get_mut();
        if buf.is_empty() {
            return;
        }
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = out.write_all(buf) {
            warn!(job = %self.full_name, error = %e, "writing to the output stream failed");
        }
        buf.clear();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiwriter::SharedOutput;
    use crate::module::mock::MockModule;
    use std::io::Write;
    use std::sync::Mutex;

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

    fn shared(out: SharedBuf) -> SharedOutput {
        Arc::new(Mutex::new(Box::new(out)))
    }

    fn job_with(module: MockModule, update_every: i64) -> (Job, SharedBuf) {
        let buf = SharedBuf::default();
        let config = JobConfig {
            plugin_name: "harvest".to_string(),
            name: "job".to_string(),
            module_name: "mock".to_string(),
            full_name: "mock_job".to_string(),
            update_every,
            auto_detect_every: 0,
            priority: 70000,
            out: shared(buf.clone()),
        };
        (Job::new(Box::new(module), config), buf)
    }

    #[test]
    fn test_penalty_progression() {
        let (mut job, _) = job_with(MockModule::default(), 1);
        for (retries, want) in [(0, 0), (4, 0), (5, 2), (10, 5), (100_000, 600)] {
            job.retries = retries;
            assert_eq!(job.penalty(), want, "retries={}", retries);
        }
    }

    #[test]
    fn test_auto_detection_success() {
        let (mut job, _) = job_with(MockModule::default(), 1);
        assert!(job.auto_detection());
        assert_eq!(job.charts.len(), 1);
        assert!(!job.panicked());
    }

    #[test]
    fn test_auto_detection_init_failure_disables() {
        let mut module = MockModule::default();
        module.init_fn = Some(Box::new(|| false));
        let cleanup = module.cleanup_count.clone();

        let (mut job, _) = job_with(module, 1);
        job.auto_detect_every = 30;

        assert!(!job.auto_detection());
        assert_eq!(job.auto_detect_every, 0);
        assert!(!job.retry_auto_detection());
        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_auto_detection_check_failure_keeps_retrying() {
        let module = MockModule::with_check(|| false);
        let (mut job, _) = job_with(module, 1);
        job.auto_detect_every = 30;
        job.auto_detect_tries = 2;

        assert!(!job.auto_detection());
        assert_eq!(job.auto_detect_tries, 1);
        assert!(job.retry_auto_detection());

        assert!(!job.auto_detection());
        assert_eq!(job.auto_detect_tries, 0);
        assert!(!job.retry_auto_detection());
    }

    #[test]
    fn test_auto_detection_infinite_tries() {
        let module = MockModule::with_check(|| false);
        let (mut job, _) = job_with(module, 1);
        job.auto_detect_every = 30;

        assert!(!job.auto_detection());
        assert_eq!(job.auto_detect_tries, INF_TRIES);
        assert!(job.retry_auto_detection());
    }

    #[test]
    fn test_auto_detection_panic_marks_and_disables() {
        let module = MockModule::with_check(|| panic!("boom"));
        let cleanup = module.cleanup_count.clone();
        let (mut job, _) = job_with(module, 1);
        job.auto_detect_every = 30;

        assert!(!job.auto_detection());
        assert!(job.panicked());
        assert_eq!(job.auto_detect_every, 0);
        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_once_emits_chart_and_values() {
        let (mut job, buf) = job_with(MockModule::default(), 2);
        assert!(job.auto_detection());
        job.run_once();

        let out = buf.contents();
        assert!(out.contains("CHART 'mock_job.mock'"), "out: {}", out);
        assert!(out.contains("'2'"), "update_every in CHART: {}", out);
        assert!(out.contains("DIMENSION 'value'"), "out: {}", out);
        assert!(out.contains("BEGIN mock_job.mock\n"), "out: {}", out);
        assert!(out.contains("SET value = 1"), "out: {}", out);
        assert!(out.contains("END\n\n"), "out: {}", out);
        assert_eq!(job.retries, 0);
    }

    #[test]
    fn test_run_once_dry_collect_counts_retries() {
        let module = MockModule::with_collect(|| None);
        let (mut job, buf) = job_with(module, 1);
        assert!(job.auto_detection());

        job.run_once();
        job.run_once();

        assert_eq!(job.retries, 2);
        // Charts are defined, the runtime chart included, but no values
        // follow.
        let out = buf.contents();
        assert!(out.contains("CHART 'mock_job.mock'"));
        assert!(out.contains("CHART 'harvest.execution_time_of_mock_job'"));
        assert!(!out.contains("SET value"));
        assert!(!out.contains("BEGIN harvest.execution_time_of_mock_job"));
    }

    #[test]
    fn test_run_once_absent_dims_emit_empty_sets() {
        let module = MockModule::with_collect(|| Some(HashMap::from([("other".to_string(), 9)])));
        let (mut job, buf) = job_with(module, 1);
        assert!(job.auto_detection());

        job.run_once();

        let out = buf.contents();
        assert!(out.contains("SET value = \n"), "out: {}", out);
        assert_eq!(job.retries, 1);
    }

    #[test]
    fn test_run_once_collect_panic_marks_job() {
        let module = MockModule::with_collect(|| panic!("collect exploded"));
        let (mut job, buf) = job_with(module, 1);
        assert!(job.auto_detection());

        job.run_once();

        assert!(job.panicked());
        assert_eq!(buf.contents(), "");
    }

    #[test]
    fn test_marked_remove_emits_obsolete_once() {
        let (mut job, buf) = job_with(MockModule::default(), 1);
        assert!(job.auto_detection());
        job.run_once();

        job.charts.get_mut("mock").unwrap().mark_remove();
        job.run_once();
        job.run_once();

        let out = buf.contents();
        assert_eq!(out.matches("'obsolete'").count(), 1, "out: {}", out);
        assert!(job.charts.is_empty());
    }

    #[tokio::test]
    async fn test_main_loop_cleanup_and_obsolete_on_close() {
        let module = MockModule::default();
        let cleanup = module.cleanup_count.clone();
        let (mut job, buf) = job_with(module, 1);
        assert!(job.auto_detection());
        job.auto_detect_tries = INF_TRIES;

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(job.main_loop(tick_rx, busy));

        tick_tx.send(0).await.unwrap();
        drop(tick_tx);
        handle.await.unwrap();

        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
        let out = buf.contents();
        assert!(out.contains("SET value = 1"), "out: {}", out);
        assert_eq!(out.matches("'obsolete'").count(), 2, "out: {}", out);
    }

    #[tokio::test]
    async fn test_main_loop_stops_after_collect_panic() {
        let module = MockModule::with_collect(|| panic!("collect exploded"));
        let cleanup = module.cleanup_count.clone();
        let (mut job, _) = job_with(module, 1);
        assert!(job.auto_detection());

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(job.main_loop(tick_rx, busy));

        tick_tx.send(0).await.unwrap();
        handle.await.unwrap();

        assert_eq!(cleanup.load(Ordering::SeqCst), 1);
        // Further ticks go nowhere.
        assert!(tick_tx.send(1).await.is_err());
    }

    #[tokio::test]
    async fn test_main_loop_skips_off_interval_ticks() {
        let module = MockModule::default();
        let (mut job, buf) = job_with(module, 2);
        assert!(job.auto_detection());

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(job.main_loop(tick_rx, busy));

        tick_tx.send(1).await.unwrap();
        tick_tx.send(3).await.unwrap();
        drop(tick_tx);
        handle.await.unwrap();

        assert!(!buf.contents().contains("BEGIN"));
    }
}
