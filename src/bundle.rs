//! Bundles of policy files built from a commit.
//!
//! A full bundle carries every in-scope file at a commit. A diff bundle
//! carries only what changed since a base commit, plus the paths deleted
//! since then. Scope comes from the source descriptor: directories,
//! extensions, and ignore globs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{Delta, ObjectType, Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SourceDescriptor;

/// Errors produced while building a bundle.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] globset::Error),
}

/// One file carried in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub path: String,
    pub contents: String,
}

/// Files of a commit, optionally relative to a base commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Commit the bundle was built from.
    pub hash: String,
    /// Base commit for a diff bundle, `None` for a full bundle.
    pub old_hash: Option<String>,
    /// Load order of the bundle's files.
    pub manifest: Vec<String>,
    pub files: Vec<BundleFile>,
    #[serde(default)]
    pub deleted_files: Vec<String>,
}

impl Bundle {
    pub fn is_diff(&self) -> bool {
        self.old_hash.is_some()
    }

    pub fn file(&self, path: &str) -> Option<&BundleFile> {
        self.files.iter().find(|file| file.path == path)
    }
}

/// Turns a commit of a clone into a [`Bundle`].
pub trait BundleBuilder: Send + Sync {
    /// Every in-scope file at `commit`.
    fn build(&self, repo: &Repository, commit: Oid) -> Result<Bundle, BundleError>;

    /// In-scope files changed between `base` and `commit`.
    fn build_diff(&self, repo: &Repository, base: Oid, commit: Oid)
    -> Result<Bundle, BundleError>;
}

/// Which paths of a tree belong in a bundle.
#[derive(Debug, Clone)]
pub struct BundleScope {
    directories: Vec<PathBuf>,
    extensions: BTreeSet<String>,
    ignore: GlobSet,
    manifest: PathBuf,
}

impl BundleScope {
    pub fn from_descriptor(source: &SourceDescriptor) -> Result<Self, BundleError> {
        let directories = source
            .directories
            .iter()
            .map(|dir| normalize(dir))
            .collect::<Vec<_>>();

        let extensions = source
            .extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let mut builder = GlobSetBuilder::new();
        for pattern in &source.bundle_ignore {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            directories,
            extensions,
            ignore: builder.build()?,
            manifest: normalize(&source.manifest),
        })
    }

    /// Whether `path` (relative to the tree root) goes in the bundle.
    pub fn includes(&self, path: &str) -> bool {
        let path = Path::new(path);
        if path == self.manifest {
            return false;
        }

        let in_directory = self.directories.is_empty()
            || self
                .directories
                .iter()
                .any(|dir| dir.as_os_str().is_empty() || path.starts_with(dir));
        if !in_directory {
            return false;
        }

        if !self.extensions.is_empty() {
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
                .unwrap_or(false);
            if !matches {
                return false;
            }
        }

        !self.ignore.is_match(path)
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest
    }
}

// Strip `./` and a bare `.` so both mean the tree root.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

/// Builds bundles straight from git trees, without touching the worktree.
#[derive(Debug, Clone)]
pub struct TreeBundleBuilder {
    scope: BundleScope,
}

impl TreeBundleBuilder {
    pub fn new(scope: BundleScope) -> Self {
        Self { scope }
    }

    pub fn from_descriptor(source: &SourceDescriptor) -> Result<Self, BundleError> {
        Ok(Self::new(BundleScope::from_descriptor(source)?))
    }

    fn tree_at<'r>(repo: &'r Repository, commit: Oid) -> Result<Tree<'r>, BundleError> {
        Ok(repo.find_commit(commit)?.tree()?)
    }

    /// All in-scope blob paths of `tree`, sorted.
    fn included_paths(&self, tree: &Tree<'_>) -> Result<Vec<(String, Oid)>, BundleError> {
        let mut entries = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob)
                && let Some(name) = entry.name()
            {
                let path = format!("{}{}", root, name);
                if self.scope.includes(&path) {
                    entries.push((path, entry.id()));
                }
            }
            TreeWalkResult::Ok
        })?;
        entries.sort();
        Ok(entries)
    }

    /// In-scope text files of `tree`, sorted by path. Binary blobs are skipped.
    fn text_files(&self, repo: &Repository, tree: &Tree<'_>) -> Result<Vec<BundleFile>, BundleError> {
        let mut files = Vec::new();
        for (path, id) in self.included_paths(tree)? {
            if let Some(contents) = read_text(repo, id, &path)? {
                files.push(BundleFile { path, contents });
            }
        }
        Ok(files)
    }

    /// Manifest file lines if the tree has one, else the included paths.
    fn manifest(
        &self,
        repo: &Repository,
        tree: &Tree<'_>,
        included: &[String],
    ) -> Result<Vec<String>, BundleError> {
        let entry = match tree.get_path(self.scope.manifest_path()) {
            Ok(entry) if entry.kind() == Some(ObjectType::Blob) => entry,
            _ => return Ok(included.to_vec()),
        };
        let path = self.scope.manifest_path().display().to_string();
        let Some(text) = read_text(repo, entry.id(), &path)? else {
            return Ok(included.to_vec());
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

/// Blob contents as text, or `None` (with a warning) for binary data.
fn read_text(repo: &Repository, id: Oid, path: &str) -> Result<Option<String>, BundleError> {
    let blob = repo.find_blob(id)?;
    match String::from_utf8(blob.content().to_vec()) {
        Ok(text) => Ok(Some(text)),
        Err(_) => {
            log::warn!("skipping {}: not valid UTF-8", path);
            Ok(None)
        }
    }
}

impl BundleBuilder for TreeBundleBuilder {
    fn build(&self, repo: &Repository, commit: Oid) -> Result<Bundle, BundleError> {
        let tree = Self::tree_at(repo, commit)?;
        let files = self.text_files(repo, &tree)?;

        let included: Vec<String> = files.iter().map(|file| file.path.clone()).collect();
        let manifest = self.manifest(repo, &tree, &included)?;
        log::debug!("built full bundle at {} with {} files", commit, files.len());

        Ok(Bundle {
            hash: commit.to_string(),
            old_hash: None,
            manifest,
            files,
            deleted_files: Vec::new(),
        })
    }

    fn build_diff(
        &self,
        repo: &Repository,
        base: Oid,
        commit: Oid,
    ) -> Result<Bundle, BundleError> {
        let base_tree = Self::tree_at(repo, base)?;
        let tree = Self::tree_at(repo, commit)?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&tree), None)?;

        let mut files = Vec::new();
        let mut deleted_files = Vec::new();
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Deleted => {
                    if let Some(path) = delta.old_file().path().and_then(Path::to_str)
                        && self.scope.includes(path)
                    {
                        deleted_files.push(path.to_string());
                    }
                }
                Delta::Added | Delta::Modified | Delta::Renamed | Delta::Copied
                | Delta::Typechange => {
                    let new_file = delta.new_file();
                    if let Some(path) = new_file.path().and_then(Path::to_str)
                        && self.scope.includes(path)
                        && let Some(contents) = read_text(repo, new_file.id(), path)?
                    {
                        files.push(BundleFile {
                            contents,
                            path: path.to_string(),
                        });
                    }
                    if delta.status() == Delta::Renamed
                        && let Some(old) = delta.old_file().path().and_then(Path::to_str)
                        && self.scope.includes(old)
                    {
                        deleted_files.push(old.to_string());
                    }
                }
                _ => {}
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        deleted_files.sort();

        let included: Vec<String> = self
            .text_files(repo, &tree)?
            .into_iter()
            .map(|file| file.path)
            .collect();
        let manifest = self.manifest(repo, &tree, &included)?;
        log::debug!(
            "built diff bundle {}..{} with {} changed and {} deleted files",
            base,
            commit,
            files.len(),
            deleted_files.len()
        );

        Ok(Bundle {
            hash: commit.to_string(),
            old_hash: Some(base.to_string()),
            manifest,
            files,
            deleted_files,
        })
    }
}
