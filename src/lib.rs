//! Keeps local clones of remote git repositories in sync and reports when a
//! tracked branch moves.
//!
//! A [`GitSourceFetcher`] owns one source: it clones on first use, fetches
//! when asked (or when a hinted commit is missing), notifies a
//! [`ChangeNotifier`] with the old and new branch heads, and builds
//! [`Bundle`]s of the tracked branch on demand.

pub mod auth;
pub mod bundle;
pub mod cache;
pub mod fetcher;
pub mod types;

#[cfg(test)]
mod test_support;

pub use bundle::{Bundle, BundleBuilder, BundleError, BundleFile, TreeBundleBuilder};
pub use cache::{GitError, LockScope, SourceLocks, SourcePaths};
pub use fetcher::{ChangeNotifier, FetchDecision, FetchError, GitSourceFetcher, NoopNotifier};
pub use types::{ConfigError, SourceAuth, SourceDescriptor, SourceId};
