//! Collector module contract and registration.
//!
//! A module is the unit of metric computation: the orchestrator drives it
//! through `init → check → charts → collect(…)` and never looks inside.
//! Modules are registered in a [`Registry`] built from a static table at
//! startup and handed to discovery and build explicitly.

pub mod charts;
pub mod example;
pub mod mock;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::confgroup::Config;
use crate::module::charts::Charts;

/// Global fallback data collection interval, seconds.
pub const UPDATE_EVERY: i64 = 1;
/// Global fallback auto-detection retry, seconds (0 disables retrying).
pub const AUTO_DETECTION_RETRY: i64 = 0;
/// Global fallback chart priority.
pub const PRIORITY: i64 = 70000;

/// Errors surfaced while instantiating a module from a job configuration.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("unknown module '{0}'")]
    Unknown(String),

    #[error("invalid job configuration: {0}")]
    Decode(#[from] serde_yaml::Error),
}

/// The collector contract.
///
/// All methods are synchronous; a module that needs I/O performs it inline
/// and the job wrapper accounts for the time it takes. A panic anywhere in
/// the contract is caught by the wrapper and permanently disables the job.
pub trait Module: Send {
    /// One-time initialization. Returning `false` disables the job for good.
    fn init(&mut self) -> bool;

    /// Probe the target. Returning `false` means "not viable right now";
    /// the job may be retried depending on its auto-detection settings.
    fn check(&mut self) -> bool;

    /// The chart definitions this module will populate. `None` (or charts
    /// that fail structural validation) disables the job.
    fn charts(&mut self) -> Option<Charts>;

    /// Collect one round of metrics, keyed by dimension id.
    /// `None` or an empty map counts as a dry run.
    fn collect(&mut self) -> Option<HashMap<String, i64>>;

    /// Release resources. Called exactly once when the job stops.
    fn cleanup(&mut self) {}
}

/// Factory producing a configured module instance from a raw job config.
pub type Factory = Box<dyn Fn(&Config) -> Result<Box<dyn Module>, ModuleError> + Send + Sync>;

/// Registration record for one module: its factory plus scheduling defaults.
pub struct Creator {
    /// Default data collection interval; 0 falls back to the global.
    pub update_every: i64,
    /// Default auto-detection retry; 0 falls back to the global.
    pub auto_detection_retry: i64,
    /// Default chart priority; 0 falls back to the global.
    pub priority: i64,
    /// Modules that are expensive or niche opt out of the default run and
    /// start only when explicitly enabled.
    pub disabled_by_default: bool,
    pub create: Factory,
}

impl Creator {
    pub fn new(create: Factory) -> Self {
        Creator {
            update_every: 0,
            auto_detection_retry: 0,
            priority: 0,
            disabled_by_default: false,
            create,
        }
    }
}

impl std::fmt::Debug for Creator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Creator")
            .field("update_every", &self.update_every)
            .field("auto_detection_retry", &self.auto_detection_retry)
            .field("priority", &self.priority)
            .field("disabled_by_default", &self.disabled_by_default)
            .finish_non_exhaustive()
    }
}

/// All known collector modules, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    items: HashMap<String, Creator>,
}

impl Registry {
    pub fn register(&mut self, name: impl Into<String>, creator: Creator) {
        self.items.insert(name.into(), creator);
    }

    pub fn lookup(&self, name: &str) -> Option<&Creator> {
        self.items.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Creator)> {
        self.items.iter()
    }

    pub fn into_iter(self) -> impl Iterator<Item = (String, Creator)> {
        self.items.into_iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Decode a raw job configuration into a module's typed configuration.
///
/// The generic tree is re-interpreted through serde, so unknown keys reach
/// the module only if its configuration type keeps them.
pub fn decode_config<T: DeserializeOwned>(config: &Config) -> Result<T, ModuleError> {
    let value = serde_yaml::to_value(config)?;
    Ok(serde_yaml::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct ProbeConfig {
        name: String,
        #[serde(default)]
        timeout: i64,
    }

    #[test]
    fn test_decode_config_typed() {
        let mut config = Config::default();
        config.set("name", "probe");
        config.set("timeout", 5);

        let decoded: ProbeConfig = decode_config(&config).unwrap();
        assert_eq!(decoded.name, "probe");
        assert_eq!(decoded.timeout, 5);
    }

    #[test]
    fn test_decode_config_missing_required() {
        let config = Config::default();
        let result: Result<ProbeConfig, _> = decode_config(&config);
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_register_lookup() {
        let mut registry = Registry::default();
        registry.register(
            "mock",
            Creator::new(Box::new(|_| Ok(Box::new(mock::MockModule::default())))),
        );

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("mock").is_some());
        assert!(registry.lookup("missing").is_none());
    }
}
