//! Job configuration primitives.
//!
//! A [`Config`] is an opaque string-keyed map describing one collection job.
//! A handful of keys (`module`, `name`, `update_every`, `autodetection_retry`,
//! `priority`) have typed accessors; everything else is passed through to the
//! collector module untouched. A [`Group`] bundles all configurations that
//! originate from one source (usually one file) and is the unit of atomic
//! replacement downstream.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::module;

/// One job configuration: an ordered map of raw YAML values plus the
/// provenance of the discoverer that produced it.
///
/// Equality compares the entries only; provenance is metadata and does not
/// participate in equality or in [`Config::fingerprint`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    items: BTreeMap<String, Value>,

    #[serde(skip)]
    provider: String,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl Config {
    /// Look up a raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    /// Insert or replace a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.items.insert(key.into(), value.into());
    }

    /// Name of the discoverer this configuration came from.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn set_provider(&mut self, provider: impl Into<String>) {
        self.provider = provider.into();
    }

    /// Job name; empty when not set or not a string.
    pub fn name(&self) -> &str {
        self.get_str("name")
    }

    /// Module name; empty when not set or not a string.
    pub fn module(&self) -> &str {
        self.get_str("module")
    }

    /// Stable identifier used for uniqueness: `module` when `name` is unset
    /// or equal to the module name, `module_name` otherwise.
    pub fn full_name(&self) -> String {
        let (module, name) = (self.module(), self.name());
        if name.is_empty() || name == module {
            module.to_string()
        } else {
            format!("{}_{}", module, name)
        }
    }

    pub fn update_every(&self) -> i64 {
        self.get_int("update_every")
    }

    pub fn auto_detection_retry(&self) -> i64 {
        self.get_int("autodetection_retry")
    }

    pub fn priority(&self) -> i64 {
        self.get_int("priority")
    }

    /// Fill in missing scheduling fields.
    ///
    /// Precedence, higher wins when present and positive: explicit field,
    /// then `defaults`, then the hard-coded module globals. `update_every`
    /// is clamped up to `min_update_every` when the latter is positive.
    /// A missing `name` becomes the module name; whitespace inside `name`
    /// collapses to `_`.
    pub fn apply(&mut self, defaults: &Defaults) {
        let update_every = first_positive(&[
            self.update_every(),
            defaults.update_every,
            module::UPDATE_EVERY,
        ]);
        self.set("update_every", update_every);

        let retry = first_positive(&[
            self.auto_detection_retry(),
            defaults.autodetection_retry,
            module::AUTO_DETECTION_RETRY,
        ]);
        self.set("autodetection_retry", retry);

        let priority = first_positive(&[self.priority(), defaults.priority, module::PRIORITY]);
        self.set("priority", priority);

        if defaults.min_update_every > 0 && self.update_every() < defaults.min_update_every {
            self.set("update_every", defaults.min_update_every);
        }

        let name = self.name();
        if name.is_empty() {
            let module = self.module().to_string();
            self.set("name", module);
        } else if name.chars().any(char::is_whitespace) {
            let cleaned = name.split_whitespace().collect::<Vec<_>>().join("_");
            self.set("name", cleaned);
        }
    }

    /// Stable 64-bit fingerprint over the normalized key/value entries.
    ///
    /// Equal configurations always produce the same fingerprint regardless
    /// of the order nested mappings were written in.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for (key, value) in &self.items {
            hasher.write(key.as_bytes());
            hasher.write_u8(b'=');
            hash_value(&mut hasher, value);
            hasher.write_u8(b'\n');
        }
        hasher.finish()
    }

    fn get_str(&self, key: &str) -> &str {
        self.items.get(key).and_then(Value::as_str).unwrap_or("")
    }

    fn get_int(&self, key: &str) -> i64 {
        self.items.get(key).and_then(Value::as_i64).unwrap_or(0)
    }
}

impl FromIterator<(String, Value)> for Config {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Config {
            items: iter.into_iter().collect(),
            provider: String::new(),
        }
    }
}

fn hash_value(hasher: &mut FnvHasher, value: &Value) {
    match value {
        Value::Null => hasher.write_u8(0),
        Value::Bool(b) => {
            hasher.write_u8(1);
            hasher.write_u8(*b as u8);
        }
        Value::Number(n) => {
            hasher.write_u8(2);
            hasher.write(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.write_u8(3);
            hasher.write(s.as_bytes());
        }
        Value::Sequence(seq) => {
            hasher.write_u8(4);
            for item in seq {
                hash_value(hasher, item);
            }
        }
        Value::Mapping(map) => {
            // Nested mappings are unordered; sort by key rendering so that
            // equal maps hash equally.
            hasher.write_u8(5);
            let mut entries: Vec<(String, &Value)> = map
                .iter()
                .map(|(k, v)| (serde_yaml::to_string(k).unwrap_or_default(), v))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, item) in entries {
                hasher.write(key.as_bytes());
                hash_value(hasher, item);
            }
        }
        Value::Tagged(tagged) => {
            hasher.write_u8(6);
            hasher.write(tagged.tag.to_string().as_bytes());
            hash_value(hasher, &tagged.value);
        }
    }
}

fn first_positive(values: &[i64]) -> i64 {
    values.iter().copied().find(|v| *v > 0).unwrap_or(0)
}

/// All job configurations originating from one source.
///
/// Arrival of a group supersedes everything previously known from the same
/// source; an empty `configs` means the source vanished.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Group {
    pub source: String,
    pub configs: Vec<Config>,
}

/// Scheduling defaults applied to configurations during parsing.
///
/// Zero means "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub min_update_every: i64,
    #[serde(default)]
    pub update_every: i64,
    #[serde(default)]
    pub autodetection_retry: i64,
    #[serde(default)]
    pub priority: i64,
}

impl Defaults {
    /// Merge two default sets field-wise; `self` wins where positive.
    pub fn merge(self, other: Defaults) -> Defaults {
        Defaults {
            min_update_every: first_positive(&[self.min_update_every, other.min_update_every]),
            update_every: first_positive(&[self.update_every, other.update_every]),
            autodetection_retry: first_positive(&[
                self.autodetection_retry,
                other.autodetection_retry,
            ]),
            priority: first_positive(&[self.priority, other.priority]),
        }
    }
}

/// Per-module scheduling defaults, keyed by module name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    items: HashMap<String, Defaults>,
}

impl Registry {
    pub fn register(&mut self, name: impl Into<String>, defaults: Defaults) {
        self.items.insert(name.into(), defaults);
    }

    pub fn lookup(&self, name: &str) -> Option<Defaults> {
        self.items.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
