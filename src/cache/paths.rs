//! Source directory path management
//!
//! This module provides the `SourcePaths` struct which manages all filesystem
//! paths for the source cache layout:
//!
//! ```text
//! <base>/
//! └── git_sources/
//!     ├── <source_id>/                     # Working clone
//!     ├── .staging-<source_id>-<n>/        # Clone in progress (repair)
//!     └── .locks/
//!         └── <source_id>                  # flock-based locking
//! ```

use std::path::{Path, PathBuf};

use crate::types::SourceId;

const SOURCES_DIR: &str = "git_sources";
const LOCKS_DIR: &str = ".locks";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Manages all filesystem paths for the source cache layout
#[derive(Debug, Clone)]
pub struct SourcePaths {
    root: PathBuf,
}

impl SourcePaths {
    /// Creates a new SourcePaths with the specified base directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the base directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the sources directory path: `{root}/git_sources`
    pub fn sources_dir(&self) -> PathBuf {
        self.root.join(SOURCES_DIR)
    }

    /// Returns the locks directory path: `{root}/git_sources/.locks`
    pub fn locks_dir(&self) -> PathBuf {
        self.sources_dir().join(LOCKS_DIR)
    }

    /// Returns the clone directory for a source: `{root}/git_sources/{id}`
    pub fn clone_dir(&self, id: &SourceId) -> PathBuf {
        self.sources_dir().join(id.as_str())
    }

    /// Returns the lock file path: `{root}/git_sources/.locks/{id}`
    pub fn lock_path(&self, id: &SourceId) -> PathBuf {
        self.locks_dir().join(id.as_str())
    }

    /// Returns a staging directory for a fresh clone of a source.
    ///
    /// `unique` distinguishes concurrent or leftover staging directories.
    pub fn staging_dir(&self, id: &SourceId, unique: &str) -> PathBuf {
        self.sources_dir()
            .join(format!("{}{}-{}", STAGING_PREFIX, id.as_str(), unique))
    }

    /// Returns a directory name to move a replaced clone to before deletion.
    pub fn trash_dir(&self, id: &SourceId, unique: &str) -> PathBuf {
        self.sources_dir()
            .join(format!("{}{}-{}", TRASH_PREFIX, id.as_str(), unique))
    }

    /// Lists leftover staging and trash directories belonging to a source.
    pub fn leftover_dirs(&self, id: &SourceId) -> Vec<PathBuf> {
        let staging = format!("{}{}-", STAGING_PREFIX, id.as_str());
        let trash = format!("{}{}-", TRASH_PREFIX, id.as_str());

        let Ok(entries) = std::fs::read_dir(self.sources_dir()) else {
            return Vec::new();
        };

        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&staging) || name.starts_with(&trash))
            })
            .map(|entry| entry.path())
            .collect()
    }
}

impl Default for SourcePaths {
    /// Creates a SourcePaths using the system cache directory + "git-source-sync"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("git-source-sync"))
    }
}
