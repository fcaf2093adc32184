//! Example collector: emits a deterministic sawtooth.
//!
//! Exists so a fresh install produces data end to end without any external
//! target. Disabled by default.

use std::collections::HashMap;

use serde::Deserialize;

use crate::module::charts::{Chart, Charts, Dim};
use crate::module::{Creator, Module, decode_config};

fn default_lines() -> usize {
    4
}

#[derive(Debug, Deserialize)]
pub struct ExampleConfig {
    /// Number of dimensions on the chart.
    #[serde(default = "default_lines")]
    pub lines: usize,
}

#[derive(Debug)]
pub struct Example {
    lines: usize,
    counter: i64,
}

impl Example {
    pub fn new(config: ExampleConfig) -> Self {
        Example {
            lines: config.lines.max(1),
            counter: 0,
        }
    }
}

impl Module for Example {
    fn init(&mut self) -> bool {
        true
    }

    fn check(&mut self) -> bool {
        true
    }

    fn charts(&mut self) -> Option<Charts> {
        let dims = (0..self.lines)
            .map(|i| Dim::new(format!("line{}", i)))
            .collect();
        Some(
            [Chart {
                id: "sawtooth".to_string(),
                title: "A Sawtooth".to_string(),
                units: "events/s".to_string(),
                family: "example".to_string(),
                context: "example.sawtooth".to_string(),
                dims,
                ..Chart::default()
            }]
            .into_iter()
            .collect(),
        )
    }

    fn collect(&mut self) -> Option<HashMap<String, i64>> {
        self.counter = (self.counter + 1) % 100;
        Some(
            (0..self.lines)
                .map(|i| (format!("line{}", i), self.counter + i as i64))
                .collect(),
        )
    }
}

/// Registration record for the example module.
pub fn creator() -> Creator {
    Creator {
        disabled_by_default: true,
        ..Creator::new(Box::new(|config| {
            let typed: ExampleConfig = decode_config(config)?;
            Ok(Box::new(Example::new(typed)))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confgroup::Config;

    #[test]
    fn test_example_collect_progresses() {
        let mut example = Example::new(ExampleConfig { lines: 2 });
        assert!(example.init());
        assert!(example.check());
        assert_eq!(example.charts().unwrap().len(), 1);

        let first = example.collect().unwrap();
        let second = example.collect().unwrap();
        assert_eq!(first.len(), 2);
        assert_ne!(first["line0"], second["line0"]);
    }

    #[test]
    fn test_example_creator_decodes_config() {
        let mut config = Config::default();
        config.set("lines", 2);

        let creator = creator();
        let mut module = (creator.create)(&config).unwrap();
        assert_eq!(module.collect().unwrap().len(), 2);
    }
}
