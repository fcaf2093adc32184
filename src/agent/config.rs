//! Plugin-level configuration file.
//!
//! Besides the fixed keys, any other top-level boolean is treated as a
//! per-module enable switch, so `nginx: no` disables the nginx module
//! without any nesting.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed plugin configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Master switch; when off the plugin prints DISABLE and exits.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether modules run unless explicitly disabled.
    #[serde(default = "default_true")]
    pub default_run: bool,

    /// Upper bound on runtime worker threads; 0 leaves the default.
    #[serde(default)]
    pub max_procs: usize,

    /// Glob patterns handed to the service-discovery watcher.
    #[serde(default)]
    pub sd_conf_path: Vec<String>,

    /// Loose per-module enable switches; non-boolean values are ignored.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            enabled: true,
            default_run: true,
            max_procs: 0,
            sd_conf_path: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl PluginConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        if content.trim().is_empty() {
            return Ok(PluginConfig::default());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Whether `module` is explicitly switched on.
    pub fn explicitly_enabled(&self, module: &str) -> bool {
        self.module_switch(module).unwrap_or(false)
    }

    /// Whether `module` should run under the default policy.
    pub fn implicitly_enabled(&self, module: &str) -> bool {
        self.module_switch(module).unwrap_or(self.default_run)
    }

    fn module_switch(&self, module: &str) -> Option<bool> {
        self.extra.get(module).and_then(serde_yaml::Value::as_bool)
    }
}
