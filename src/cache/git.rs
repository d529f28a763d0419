//! Git operations on a source clone, all through libgit2.
//!
//! **Network operations** take the source's auth so the credential callback can
//! answer from memory:
//! - `clone_branch` - full clone with the tracked branch checked out
//! - `fetch_remote` - fetch the configured refspecs of one remote
//!
//! **Local reads and ref updates:**
//! - `has_clone` / `open_repository` - discovery
//! - `verify_remote_url` - clone belongs to this source
//! - `remote_branch_commit` / `local_branch_commit` / `resolve_commit`
//! - `set_local_branch` - advance the tracking ref

use git2::build::RepoBuilder;
use git2::{Oid, Repository};
use std::path::Path;
use thiserror::Error;

use crate::auth::fetch_options;
use crate::types::SourceAuth;

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// None of the clone's remotes points at the expected URL.
    #[error("no remote matches {expected} (found: {found:?})")]
    RemoteMismatch { expected: String, found: Vec<String> },
    /// Clone failed.
    #[error("clone failed: {0}")]
    CloneError(#[source] git2::Error),
    /// Fetch failed.
    #[error("fetch failed: {0}")]
    FetchError(#[source] git2::Error),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Validate that a git ref (branch name or commit SHA) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

fn local_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

fn remote_ref(remote: &str, branch: &str) -> String {
    format!("refs/remotes/{}/{}", remote, branch)
}

// ============================================================================
// Network operations
// ============================================================================

/// Clone `url` into `dest` with `branch` checked out.
///
/// The clone's remote is named `remote_name` and records `url` verbatim,
/// which is what [`verify_remote_url`] later compares against.
pub fn clone_branch(
    url: &str,
    branch: &str,
    remote_name: &str,
    dest: &Path,
    auth: &SourceAuth,
) -> Result<Repository, GitError> {
    validate_git_ref(branch, "branch")?;
    validate_git_ref(remote_name, "remote")?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    RepoBuilder::new()
        .branch(branch)
        .remote_create(move |repo, _name, url| repo.remote(remote_name, url))
        .fetch_options(fetch_options(auth))
        .clone(url, dest)
        .map_err(GitError::CloneError)
}

/// Fetch a remote using its configured refspecs.
pub fn fetch_remote(repo: &Repository, remote_name: &str, auth: &SourceAuth) -> Result<(), GitError> {
    let mut remote = repo.find_remote(remote_name)?;
    let mut options = fetch_options(auth);
    remote
        .fetch(&[] as &[&str], Some(&mut options), None)
        .map_err(GitError::FetchError)
}

// ============================================================================
// Local operations
// ============================================================================

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Check if a path holds a working clone (a `.git` directory inside it).
pub fn has_clone(path: &Path) -> bool {
    path.join(".git").exists() && Repository::open(path).is_ok()
}

/// Verify that one of the clone's remotes points at `expected_url`.
///
/// Returns the matching remote's name.
pub fn verify_remote_url(repo: &Repository, expected_url: &str) -> Result<String, GitError> {
    let mut found = Vec::new();

    for name in repo.remotes()?.iter().flatten() {
        let remote = repo.find_remote(name)?;
        match remote.url() {
            Some(url) if url == expected_url => return Ok(name.to_string()),
            Some(url) => found.push(url.to_string()),
            None => {}
        }
    }

    Err(GitError::RemoteMismatch {
        expected: expected_url.to_string(),
        found,
    })
}

/// Whether the clone knows `branch` on `remote`.
pub fn has_remote_branch(repo: &Repository, remote: &str, branch: &str) -> bool {
    repo.find_reference(&remote_ref(remote, branch)).is_ok()
}

/// Commit the remote-tracking ref of `branch` points at, if any.
pub fn remote_branch_commit(repo: &Repository, remote: &str, branch: &str) -> Option<Oid> {
    ref_commit(repo, &remote_ref(remote, branch))
}

/// Commit the local branch points at, if the branch exists.
pub fn local_branch_commit(repo: &Repository, branch: &str) -> Option<Oid> {
    ref_commit(repo, &local_ref(branch))
}

fn ref_commit(repo: &Repository, refname: &str) -> Option<Oid> {
    repo.find_reference(refname)
        .and_then(|reference| reference.peel_to_commit())
        .map(|commit| commit.id())
        .ok()
}

/// Resolve a revision (full or abbreviated SHA, ref name) to a commit present
/// in the local object store.
pub fn resolve_commit(repo: &Repository, rev: &str) -> Option<Oid> {
    if validate_git_ref(rev, "revision").is_err() {
        return None;
    }
    repo.revparse_single(rev)
        .and_then(|object| object.peel_to_commit())
        .map(|commit| commit.id())
        .ok()
}

/// Create or move the local branch to `commit`.
pub fn set_local_branch(repo: &Repository, branch: &str, commit: Oid) -> Result<(), GitError> {
    validate_git_ref(branch, "branch")?;
    repo.reference(
        &local_ref(branch),
        commit,
        true,
        &format!("git-source-sync: track {}", commit),
    )?;
    Ok(())
}

/// The commit HEAD points at.
pub fn head_commit(repo: &Repository) -> Result<Oid, GitError> {
    Ok(repo.head()?.peel_to_commit()?.id())
}

// ============================================================================
// Tests
// ============================================================================
