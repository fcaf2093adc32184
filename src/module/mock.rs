//! Scriptable mock module used by orchestrator tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::module::Module;
use crate::module::charts::{Chart, Charts, Dim};

type BoolFn = Box<dyn FnMut() -> bool + Send>;
type ChartsFn = Box<dyn FnMut() -> Option<Charts> + Send>;
type CollectFn = Box<dyn FnMut() -> Option<HashMap<String, i64>> + Send>;

/// A module whose every step can be overridden by a closure.
///
/// Defaults: init and check succeed, charts returns one single-dimension
/// chart, collect fills that dimension with 1. `cleanup_count` is shared so
/// tests can observe cleanup after the module was moved into a job.
pub struct MockModule {
    pub init_fn: Option<BoolFn>,
    pub check_fn: Option<BoolFn>,
    pub charts_fn: Option<ChartsFn>,
    pub collect_fn: Option<CollectFn>,
    pub cleanup_count: Arc<AtomicUsize>,
}

impl Default for MockModule {
    fn default() -> Self {
        MockModule {
            init_fn: None,
            check_fn: None,
            charts_fn: None,
            collect_fn: None,
            cleanup_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockModule {
    pub fn with_check(check_fn: impl FnMut() -> bool + Send + 'static) -> Self {
        MockModule {
            check_fn: Some(Box::new(check_fn)),
            ..MockModule::default()
        }
    }

    pub fn with_collect(
        collect_fn: impl FnMut() -> Option<HashMap<String, i64>> + Send + 'static,
    ) -> Self {
        MockModule {
            collect_fn: Some(Box::new(collect_fn)),
            ..MockModule::default()
        }
    }

    /// The chart the default charts() implementation returns.
    pub fn default_charts() -> Charts {
        [Chart {
            id: "mock".to_string(),
            title: "Mock Chart".to_string(),
            units: "events".to_string(),
            family: "mock".to_string(),
            context: "mock.events".to_string(),
            dims: vec![Dim::new("value")],
            ..Chart::default()
        }]
        .into_iter()
        .collect()
    }
}

impl Module for MockModule {
    fn init(&mut self) -> bool {
        match self.init_fn.as_mut() {
            Some(f) => f(),
            None => true,
        }
    }

    fn check(&mut self) -> bool {
        match self.check_fn.as_mut() {
            Some(f) => f(),
            None => true,
        }
    }

    fn charts(&mut self) -> Option<Charts> {
        match self.charts_fn.as_mut() {
            Some(f) => f(),
            None => Some(Self::default_charts()),
        }
    }

    fn collect(&mut self) -> Option<HashMap<String, i64>> {
        match self.collect_fn.as_mut() {
            Some(f) => f(),
            None => Some(HashMap::from([("value".to_string(), 1)])),
        }
    }

    fn cleanup(&mut self) {
        self.cleanup_count.fetch_add(1, Ordering::SeqCst);
    }
}
