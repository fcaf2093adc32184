//! Multi-directory configuration lookup.

use std::path::{Path, PathBuf};

/// Ordered list of directories searched for configuration files; the first
/// match wins.
#[derive(Debug, Clone, Default)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        SearchPath {
            dirs: dirs.into_iter().collect(),
        }
    }

    /// Build the search path from `USER_CONFIG_DIR` and `STOCK_CONFIG_DIR`,
    /// in that order, skipping unset or empty values.
    pub fn from_env() -> Self {
        let dirs = ["USER_CONFIG_DIR", "STOCK_CONFIG_DIR"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .collect();
        SearchPath { dirs }
    }

    pub fn find(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

impl<P: AsRef<Path>> FromIterator<P> for SearchPath {
    fn from_iter<T: IntoIterator<Item = P>>(iter: T) -> Self {
        SearchPath {
            dirs: iter.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }
}
