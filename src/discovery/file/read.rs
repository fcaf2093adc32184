//! One-shot file reader discoverer.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::confgroup::{Group, Registry};
use crate::discovery::Discoverer;
use crate::discovery::file::{PROVIDER_READER, parse};

/// Reads every matched path once, emits the resulting groups and closes.
pub struct Reader {
    registry: Registry,
    paths: Vec<String>,
}

impl Reader {
    pub fn new(registry: Registry, paths: Vec<String>) -> Self {
        Reader { registry, paths }
    }

    fn groups(&self) -> Vec<Group> {
        let mut groups = Vec::new();
        for pattern in &self.paths {
            let matches = match glob::glob(pattern) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "bad path pattern");
                    continue;
                }
            };

            for path in matches.flatten() {
                if !path.is_file() {
                    continue;
                }
                match parse::parse_file(&self.registry, &path) {
                    Ok(Some(mut group)) => {
                        for config in &mut group.configs {
                            config.set_provider(PROVIDER_READER);
                        }
                        groups.push(group);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "parsing file failed");
                    }
                }
            }
        }
        groups
    }
}

#[async_trait]
impl Discoverer for Reader {
    async fn run(&self, token: CancellationToken, out: mpsc::Sender<Vec<Group>>) {
        let groups = self.groups();
        tokio::select! {
            _ = token.cancelled() => {}
            _ = out.send(groups) => {}
        }
        // Dropping the sender closes this discoverer's channel.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confgroup::Defaults;
    use tempfile::TempDir;

    fn registry() -> Registry {
        let mut registry = Registry::default();
        registry.register("nginx", Defaults::default());
        registry
    }

    #[test]
    fn test_groups_reads_matched_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("nginx.conf"), "jobs:\n  - name: local\n").unwrap();
        std::fs::write(dir.path().join("unknown.conf"), "jobs:\n  - name: x\n").unwrap();

        let pattern = format!("{}/*.conf", dir.path().display());
        let reader = Reader::new(registry(), vec![pattern]);

        let groups = reader.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].configs[0].name(), "local");
        assert_eq!(groups[0].configs[0].provider(), PROVIDER_READER);
    }

    #[test]
    fn test_groups_skips_malformed_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("nginx.conf"), "jobs: [broken").unwrap();

        let pattern = format!("{}/*.conf", dir.path().display());
        let reader = Reader::new(registry(), vec![pattern]);

        assert!(reader.groups().is_empty());
    }

    #[tokio::test]
    async fn test_run_emits_once_and_closes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("nginx.conf"), "jobs:\n  - name: local\n").unwrap();

        let pattern = format!("{}/*.conf", dir.path().display());
        let reader = Reader::new(registry(), vec![pattern]);

        let (tx, mut rx) = mpsc::channel(1);
        reader.run(CancellationToken::new(), tx).await;

        let groups = rx.recv().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert!(rx.recv().await.is_none());
    }
}
