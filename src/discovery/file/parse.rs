//! Job configuration file parsing.
//!
//! Two formats are accepted, discriminated by the top-level YAML shape:
//!
//! - **static**: a mapping with optional scheduling defaults and a `jobs:`
//!   list; the module name is the file stem. Files whose stem is not a
//!   registered module are silently skipped.
//! - **SD** (service discovery): a sequence of configurations, each carrying
//!   its own `module`; entries with unknown modules are dropped.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::confgroup::{Config, Defaults, Group, Registry};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unrecognized file format")]
    UnknownFormat,
}

#[derive(Debug, Deserialize)]
struct StaticConfig {
    #[serde(flatten)]
    defaults: Defaults,
    #[serde(default)]
    jobs: Vec<Config>,
}

enum Format {
    Static,
    Sd,
}

/// Parse one configuration file into a group.
///
/// `Ok(None)` means the file is valid but not for us (a static file whose
/// stem is not in the registry).
pub(crate) fn parse_file(registry: &Registry, path: &Path) -> Result<Option<Group>, ParseError> {
    let content = std::fs::read_to_string(path)?;
    match detect_format(&content)? {
        Format::Static => parse_static(registry, path, &content),
        Format::Sd => parse_sd(registry, path, &content),
    }
}

fn detect_format(content: &str) -> Result<Format, ParseError> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    match value {
        serde_yaml::Value::Mapping(_) => Ok(Format::Static),
        serde_yaml::Value::Sequence(_) => Ok(Format::Sd),
        _ => Err(ParseError::UnknownFormat),
    }
}

fn parse_static(
    registry: &Registry,
    path: &Path,
    content: &str,
) -> Result<Option<Group>, ParseError> {
    let module = file_stem(path);
    let Some(module_defaults) = registry.lookup(&module) else {
        return Ok(None);
    };

    let parsed: StaticConfig = serde_yaml::from_str(content)?;
    let defaults = parsed.defaults.merge(module_defaults);

    let mut configs = parsed.jobs;
    for config in &mut configs {
        config.set("module", module.clone());
        config.apply(&defaults);
    }

    Ok(Some(Group {
        source: path.display().to_string(),
        configs,
    }))
}

fn parse_sd(registry: &Registry, path: &Path, content: &str) -> Result<Option<Group>, ParseError> {
    let parsed: Vec<Config> = serde_yaml::from_str(content)?;

    let mut configs = Vec::with_capacity(parsed.len());
    for mut config in parsed {
        let Some(defaults) = registry.lookup(config.module()) else {
            continue;
        };
        config.apply(&defaults);
        configs.push(config);
    }

    Ok(Some(Group {
        source: path.display().to_string(),
        configs,
    }))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("")
        .to_string()
}
