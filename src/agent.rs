//! Agent assembly and supervision.
//!
//! Builds the registries, wires discovery into build into run, and keeps
//! everything alive until the root cancellation token fires. Setup is
//! synchronous and happens before the runtime starts so that `max_procs`
//! from the plugin configuration can size the runtime itself.

mod config;
mod paths;

pub use config::{ConfigError, PluginConfig};
pub use paths::SearchPath;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::apiwriter::SharedOutput;
use crate::build;
use crate::confgroup::{self, Defaults};
use crate::discovery::{self, Discoverer, file};
use crate::module;
use crate::registry::FileLockRegistry;
use crate::run;
use crate::state;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("disabled in the configuration file")]
    Disabled,

    #[error("no modules to run")]
    NoModules,

    #[error("loading plugin configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Everything `main` decides before handing over.
pub struct Config {
    pub name: String,
    pub registry: module::Registry,
    pub out: SharedOutput,
    pub conf_dirs: Vec<PathBuf>,
    pub use_module: String,
    pub min_update_every: i64,
    pub keep_alive: bool,
}

pub struct Agent {
    name: String,
    modules: Arc<module::Registry>,
    out: SharedOutput,
    search: SearchPath,
    sd_paths: Vec<String>,
    min_update_every: i64,
    max_procs: usize,
    lib_dir: PathBuf,
    keep_alive: bool,
}

impl Agent {
    /// Load the plugin configuration and decide which modules run.
    pub fn setup(config: Config) -> Result<Agent, AgentError> {
        let search = if config.conf_dirs.is_empty() {
            SearchPath::from_env()
        } else {
            SearchPath::new(config.conf_dirs)
        };

        let plugin_config = match search.find(&format!("{}.conf", config.name)) {
            Some(path) => {
                info!(path = %path.display(), "found plugin configuration");
                PluginConfig::load(&path)?
            }
            None => {
                info!("plugin configuration not found, using defaults");
                PluginConfig::default()
            }
        };

        if !plugin_config.enabled {
            return Err(AgentError::Disabled);
        }

        let modules = select_modules(config.registry, &config.use_module, &plugin_config);
        if modules.is_empty() {
            return Err(AgentError::NoModules);
        }
        info!(modules = modules.len(), "modules enabled");

        let lib_dir = std::env::var("LIB_DIR")
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Agent {
            name: config.name,
            modules: Arc::new(modules),
            out: config.out,
            search,
            sd_paths: plugin_config.sd_conf_path,
            min_update_every: config.min_update_every,
            max_procs: plugin_config.max_procs,
            lib_dir,
            keep_alive: config.keep_alive,
        })
    }

    pub fn max_procs(&self) -> usize {
        self.max_procs
    }

    /// Run every manager until `token` is cancelled, then wait for all of
    /// them to drain.
    pub async fn run(&self, token: CancellationToken) {
        let state_manager = state::Manager::new(&self.lib_dir);
        let prev_state = match state::Store::load(state_manager.path()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "loading previous state failed, starting clean");
                Arc::new(state::Store::default())
            }
        };

        let (defaults_registry, read_paths) = self.discovery_inputs();
        let mut discoverers: Vec<Arc<dyn Discoverer>> = Vec::new();
        discoverers.push(Arc::new(file::Reader::new(
            defaults_registry.clone(),
            read_paths,
        )));
        if !self.sd_paths.is_empty() {
            discoverers.push(Arc::new(file::Watcher::new(
                defaults_registry,
                self.sd_paths.clone(),
            )));
        }
        let discovery_manager = match discovery::Manager::new(discoverers) {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                warn!(error = %e, "discovery setup failed");
                return;
            }
        };

        let run_manager = Arc::new(run::Manager::new());
        let locks = Arc::new(FileLockRegistry::new(&self.lib_dir));
        let build_manager = build::Manager::new(build::ManagerConfig {
            plugin_name: self.name.clone(),
            out: self.out.clone(),
            modules: self.modules.clone(),
            runner: run_manager.clone(),
            saver: state_manager.store(),
            prev_state,
            locks,
        });

        let (groups_tx, groups_rx) = mpsc::channel(1);

        let mut tasks = Vec::new();
        {
            let token = token.clone();
            tasks.push(tokio::spawn(
                async move { state_manager.run(token).await },
            ));
        }
        {
            let manager = run_manager.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move { manager.run(token).await }));
        }
        tasks.push(tokio::spawn(
            discovery_manager.run(token.clone(), groups_tx),
        ));
        tasks.push(tokio::spawn(build_manager.run(token.clone(), groups_rx)));
        if self.keep_alive {
            tasks.push(tokio::spawn(keep_alive(token.clone(), self.out.clone())));
        }

        token.cancelled().await;
        for task in tasks {
            let _ = task.await;
        }
        run_manager.cleanup().await;
        info!("agent stopped");
    }

    /// Per-module scheduling defaults plus the static config files to read.
    fn discovery_inputs(&self) -> (confgroup::Registry, Vec<String>) {
        let mut registry = confgroup::Registry::default();
        let mut read_paths = Vec::new();

        for (name, creator) in self.modules.iter() {
            registry.register(
                name.clone(),
                Defaults {
                    min_update_every: self.min_update_every,
                    update_every: creator.update_every,
                    autodetection_retry: creator.auto_detection_retry,
                    priority: creator.priority,
                },
            );
            if let Some(path) = self.search.find(&format!("{}.conf", name)) {
                read_paths.push(path.display().to_string());
            }
        }
        (registry, read_paths)
    }
}

fn select_modules(
    registry: module::Registry,
    use_module: &str,
    plugin_config: &PluginConfig,
) -> module::Registry {
    let all = use_module.is_empty() || use_module == "all";
    let mut enabled = module::Registry::default();

    for (name, creator) in registry.into_iter() {
        if !all && use_module != name {
            continue;
        }
        if all && creator.disabled_by_default && !plugin_config.explicitly_enabled(&name) {
            info!(module = %name, "disabled by default");
            continue;
        }
        if all && !plugin_config.implicitly_enabled(&name) {
            info!(module = %name, "disabled in the configuration file");
            continue;
        }
        enabled.register(name, creator);
    }
    enabled
}

/// One blank line per second tells the host we are alive even when no job
/// is producing data.
async fn keep_alive(token: CancellationToken, out: SharedOutput) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {
                let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
                let _ = out.write_all(b"\n");
            }
        }
    }
}
