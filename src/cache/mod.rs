//! On-disk source clones: layout, locking, and git operations

mod git;
mod lock;
mod paths;
pub(crate) mod swap;

pub use git::{
    GitError, clone_branch, fetch_remote, has_clone, has_remote_branch, head_commit,
    local_branch_commit, open_repository, remote_branch_commit, resolve_commit,
    set_local_branch, validate_git_ref, verify_remote_url,
};
pub use lock::{DEFAULT_POLL_INTERVAL, FileLock, LockScope, SourceLockGuard, SourceLocks};
pub use paths::SourcePaths;
