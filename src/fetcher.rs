//! Per-source synchronization state machine.
//!
//! Every `synchronize` call runs under the source's lock and walks the same
//! phases:
//!
//! 1. Discovery: is there a clone at the source's path, and does one of its
//!    remotes point at the source URL?
//! 2. Refresh (valid clone): decide whether to fetch, fetch, then compare the
//!    remote branch head with the local tracking ref and notify on change.
//! 3. Clone (no clone, or a clone of something else): clone into a staging
//!    directory, swap it into place, notify with no previous revision.
//!
//! Transport problems never fail a cycle; they are logged and the next call
//! retries. Only a tracked branch with no anchor on the remote is fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{Oid, Repository};
use thiserror::Error;

use crate::bundle::{Bundle, BundleBuilder, BundleError, TreeBundleBuilder};
use crate::cache::{self, GitError, SourceLocks, SourcePaths, swap};
use crate::types::{SourceDescriptor, SourceId};

/// Remote name given to clones made by the fetcher.
pub const DEFAULT_REMOTE: &str = "origin";

/// Receives the tracked branch's revision transitions.
///
/// `old_revision` is `None` when the branch is seen for the first time.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn on_update(&self, old_revision: Option<String>, new_revision: String);
}

/// Notifier that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl ChangeNotifier for NoopNotifier {
    async fn on_update(&self, _old_revision: Option<String>, _new_revision: String) {}
}

/// Errors surfaced by [`GitSourceFetcher`].
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("neither branch {branch} nor base branch {base_branch} exists on remote {remote}")]
    MissingBranch {
        branch: String,
        base_branch: String,
        remote: String,
    },
    #[error("could not resolve head of branch {0}")]
    BranchHeadNotFound(String),
    #[error("failed to lock source: {0}")]
    Lock(#[source] std::io::Error),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of the fetch decision, with its reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDecision {
    /// Caller asked for a fetch.
    Forced,
    /// The clone has never seen the tracked branch on the remote.
    BranchMissing,
    /// The hinted commit is not in the local object store.
    HintUnresolved,
    /// The hinted commit is already local.
    HintPresent,
    /// No reason to go to the network.
    NoHint,
}

impl FetchDecision {
    /// Apply the decision rules in order: force, missing branch, hint.
    pub fn decide(force: bool, branch_known: bool, hint_resolved: Option<bool>) -> Self {
        if force {
            FetchDecision::Forced
        } else if !branch_known {
            FetchDecision::BranchMissing
        } else {
            match hint_resolved {
                Some(true) => FetchDecision::HintPresent,
                Some(false) => FetchDecision::HintUnresolved,
                None => FetchDecision::NoHint,
            }
        }
    }

    pub fn should_fetch(self) -> bool {
        matches!(
            self,
            FetchDecision::Forced | FetchDecision::BranchMissing | FetchDecision::HintUnresolved
        )
    }
}

impl std::fmt::Display for FetchDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            FetchDecision::Forced => "fetch (forced)",
            FetchDecision::BranchMissing => "fetch (tracked branch not known locally)",
            FetchDecision::HintUnresolved => "fetch (hinted commit not found locally)",
            FetchDecision::HintPresent => "skip (hinted commit already present)",
            FetchDecision::NoHint => "skip (no reason to fetch)",
        };
        f.write_str(reason)
    }
}

/// What discovery found at the clone path.
#[derive(Debug)]
enum LocalClone {
    Absent,
    Valid { remote: String },
    Mismatched(GitError),
}

/// Tracked branch state after an optional fetch.
#[derive(Debug, PartialEq, Eq)]
enum Change {
    HeadUnresolvable,
    Unchanged(Oid),
    Advanced { old: Option<Oid>, new: Oid },
}

/// Keeps one source's clone in sync with its remote.
pub struct GitSourceFetcher {
    source: Arc<SourceDescriptor>,
    id: SourceId,
    paths: SourcePaths,
    clone_path: PathBuf,
    remote_name: String,
    locks: Arc<SourceLocks>,
    notifier: Arc<dyn ChangeNotifier>,
    bundle_builder: Option<Arc<dyn BundleBuilder>>,
}

impl GitSourceFetcher {
    pub fn new(
        paths: SourcePaths,
        source: SourceDescriptor,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        let id = source.source_id();
        let clone_path = paths.clone_dir(&id);
        Self {
            source: Arc::new(source),
            id,
            paths,
            clone_path,
            remote_name: DEFAULT_REMOTE.to_string(),
            locks: Arc::new(SourceLocks::new()),
            notifier,
            bundle_builder: None,
        }
    }

    /// Name the remote of clones this fetcher creates.
    pub fn with_remote_name(mut self, remote_name: impl Into<String>) -> Self {
        self.remote_name = remote_name.into();
        self
    }

    /// Share a lock registry with other fetchers.
    pub fn with_locks(mut self, locks: Arc<SourceLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Replace the default [`TreeBundleBuilder`].
    pub fn with_bundle_builder(mut self, builder: Arc<dyn BundleBuilder>) -> Self {
        self.bundle_builder = Some(builder);
        self
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn source_id(&self) -> &SourceId {
        &self.id
    }

    pub fn clone_path(&self) -> &Path {
        &self.clone_path
    }

    /// Bring the clone up to date and report a changed branch head.
    ///
    /// `hinted_commit` is a commit the caller expects on the remote. When it
    /// is already local the fetch is skipped. `force` always fetches.
    pub async fn synchronize(
        &self,
        hinted_commit: Option<&str>,
        force: bool,
    ) -> Result<(), FetchError> {
        let lock_path = self.paths.lock_path(&self.id);
        let _guard = self
            .locks
            .acquire(&self.id, &lock_path)
            .await
            .map_err(FetchError::Lock)?;

        let path = self.clone_path.clone();
        let url = self.source.url.clone();
        match blocking(move || inspect_clone(&path, &url)).await? {
            LocalClone::Valid { remote } => {
                log::debug!(
                    "found clone: source={} path={} remote={}",
                    self.id.short(),
                    self.clone_path.display(),
                    remote
                );
                let hint = hinted_commit.map(str::to_string);
                return self.refresh(remote, hint, force).await;
            }
            LocalClone::Mismatched(err) => log::warn!(
                "clone does not belong to source, replacing: source={} path={} error={}",
                self.id.short(),
                self.clone_path.display(),
                err
            ),
            LocalClone::Absent => log::info!(
                "no clone yet: source={} path={}",
                self.id.short(),
                self.clone_path.display()
            ),
        }

        self.clone_and_notify().await
    }

    async fn refresh(
        &self,
        remote: String,
        hint: Option<String>,
        force: bool,
    ) -> Result<(), FetchError> {
        let path = self.clone_path.clone();
        let source = Arc::clone(&self.source);
        let fetch_remote = remote.clone();
        let outcome = blocking(move || -> Result<Option<Change>, FetchError> {
            let repo = cache::open_repository(&path)?;
            if !fetch_if_needed(&repo, &fetch_remote, &source, hint.as_deref(), force) {
                return Ok(None);
            }
            detect_change(&repo, &fetch_remote, &source).map(Some)
        })
        .await?;

        let change = match outcome {
            Ok(Some(change)) => change,
            Ok(None) => return Ok(()),
            Err(err @ FetchError::MissingBranch { .. }) => {
                log::error!("sync failed: source={} error={}", self.id.short(), err);
                return Err(err);
            }
            Err(err) => {
                log::error!("sync aborted: source={} error={}", self.id.short(), err);
                return Ok(());
            }
        };

        match change {
            Change::HeadUnresolvable => {
                log::error!(
                    "branch {} not found on remote {}: source={}",
                    self.source.branch,
                    remote,
                    self.id.short()
                );
            }
            Change::Unchanged(head) => {
                log::debug!("no change: source={} head={}", self.id.short(), head);
            }
            Change::Advanced { old, new } => {
                log::info!(
                    "branch moved: source={} branch={} old={} new={}",
                    self.id.short(),
                    self.source.branch,
                    old.map(|o| o.to_string()).unwrap_or_else(|| "none".into()),
                    new
                );
                self.notifier
                    .on_update(old.map(|o| o.to_string()), new.to_string())
                    .await;
                self.advance_tracking_ref(new).await?;
            }
        }
        Ok(())
    }

    async fn advance_tracking_ref(&self, commit: Oid) -> Result<(), FetchError> {
        let path = self.clone_path.clone();
        let branch = self.source.branch.clone();
        let result = blocking(move || -> Result<(), GitError> {
            let repo = cache::open_repository(&path)?;
            cache::set_local_branch(&repo, &branch, commit)
        })
        .await?;

        match result {
            Ok(()) => log::debug!(
                "tracking ref advanced: source={} commit={}",
                self.id.short(),
                commit
            ),
            // The next cycle sees the old ref again and re-notifies.
            Err(err) => log::error!(
                "could not advance tracking ref: source={} error={}",
                self.id.short(),
                err
            ),
        }
        Ok(())
    }

    async fn clone_and_notify(&self) -> Result<(), FetchError> {
        let paths = self.paths.clone();
        let id = self.id.clone();
        let source = Arc::clone(&self.source);
        let remote_name = self.remote_name.clone();
        let result = blocking(move || stage_clone(&paths, &id, &source, &remote_name)).await?;

        match result {
            Ok(head) => {
                log::info!(
                    "clone complete: source={} branch={} head={}",
                    self.id.short(),
                    self.source.branch,
                    head
                );
                self.notifier.on_update(None, head.to_string()).await;
            }
            Err(err) => log::error!(
                "could not clone {} (branch {}): source={} error={}",
                self.source.url,
                self.source.branch,
                self.id.short(),
                err
            ),
        }
        Ok(())
    }

    /// Commit the remote branch currently points at.
    pub async fn current_head(&self) -> Result<String, FetchError> {
        let path = self.clone_path.clone();
        let source = Arc::clone(&self.source);
        blocking(move || -> Result<String, FetchError> {
            let repo = cache::open_repository(&path)?;
            let remote = cache::verify_remote_url(&repo, &source.url)?;
            branch_head(&repo, &remote, &source.branch).map(|oid| oid.to_string())
        })
        .await?
    }

    /// Build a bundle of the remote branch head.
    ///
    /// With a base commit present in the clone this is a diff bundle against
    /// it; an unknown base falls back to a full bundle. Does not take the
    /// source lock, so it may be called from inside a notification.
    pub async fn make_bundle(&self, base_commit: Option<&str>) -> Result<Bundle, FetchError> {
        let builder = self.bundle_builder()?;
        let path = self.clone_path.clone();
        let source = Arc::clone(&self.source);
        let base = base_commit.map(str::to_string);
        let id = self.id.clone();

        blocking(move || -> Result<Bundle, FetchError> {
            let repo = cache::open_repository(&path)?;
            let remote = cache::verify_remote_url(&repo, &source.url)?;
            let head = branch_head(&repo, &remote, &source.branch)?;

            let resolved_base = base.as_deref().and_then(|b| cache::resolve_commit(&repo, b));
            let bundle = match (base, resolved_base) {
                (_, Some(base)) => builder.build_diff(&repo, base, head)?,
                (Some(base), None) => {
                    log::debug!(
                        "base commit {} not found, building full bundle: source={}",
                        base,
                        id.short()
                    );
                    builder.build(&repo, head)?
                }
                (None, None) => builder.build(&repo, head)?,
            };
            Ok(bundle)
        })
        .await?
    }

    fn bundle_builder(&self) -> Result<Arc<dyn BundleBuilder>, FetchError> {
        match &self.bundle_builder {
            Some(builder) => Ok(Arc::clone(builder)),
            None => Ok(Arc::new(TreeBundleBuilder::from_descriptor(&self.source)?)),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, FetchError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

fn inspect_clone(path: &Path, url: &str) -> LocalClone {
    if !cache::has_clone(path) {
        return LocalClone::Absent;
    }
    match cache::open_repository(path).and_then(|repo| cache::verify_remote_url(&repo, url)) {
        Ok(remote) => LocalClone::Valid { remote },
        Err(err) => LocalClone::Mismatched(err),
    }
}

/// Run the fetch decision and the fetch. Returns false when a fetch failed.
fn fetch_if_needed(
    repo: &Repository,
    remote: &str,
    source: &SourceDescriptor,
    hint: Option<&str>,
    force: bool,
) -> bool {
    let branch_known = cache::has_remote_branch(repo, remote, &source.branch);
    let hint_resolved = hint.map(|h| cache::resolve_commit(repo, h).is_some());
    let decision = FetchDecision::decide(force, branch_known, hint_resolved);
    let id = source.source_id();
    log::info!("fetch decision: source={} {}", id.short(), decision);

    if !decision.should_fetch() {
        return true;
    }

    match cache::fetch_remote(repo, remote, &source.auth) {
        Ok(()) => {
            log::info!("fetched remote {}: source={}", remote, id.short());
            true
        }
        Err(err) => {
            log::warn!(
                "fetch of {} failed, retrying next cycle: source={} error={}",
                remote,
                id.short(),
                err
            );
            false
        }
    }
}

fn detect_change(
    repo: &Repository,
    remote: &str,
    source: &SourceDescriptor,
) -> Result<Change, FetchError> {
    let Some(new) = cache::remote_branch_commit(repo, remote, &source.branch) else {
        return Ok(Change::HeadUnresolvable);
    };

    let old = match cache::local_branch_commit(repo, &source.branch) {
        Some(old) => Some(old),
        None => {
            let anchor = tracking_anchor(repo, remote, source)?;
            log::debug!(
                "first sync of branch {}, anchored at {}",
                source.branch,
                anchor
            );
            None
        }
    };

    if old == Some(new) {
        Ok(Change::Unchanged(new))
    } else {
        Ok(Change::Advanced { old, new })
    }
}

/// Commit a new tracking ref starts from: the tracked branch on the remote,
/// else the base branch.
fn tracking_anchor(
    repo: &Repository,
    remote: &str,
    source: &SourceDescriptor,
) -> Result<Oid, FetchError> {
    cache::remote_branch_commit(repo, remote, &source.branch)
        .or_else(|| cache::remote_branch_commit(repo, remote, source.base_branch()))
        .ok_or_else(|| FetchError::MissingBranch {
            branch: source.branch.clone(),
            base_branch: source.base_branch().to_string(),
            remote: remote.to_string(),
        })
}

fn branch_head(repo: &Repository, remote: &str, branch: &str) -> Result<Oid, FetchError> {
    cache::remote_branch_commit(repo, remote, branch)
        .ok_or_else(|| FetchError::BranchHeadNotFound(branch.to_string()))
}

/// Clone into a staging directory and swap it over the clone path.
fn stage_clone(
    paths: &SourcePaths,
    id: &SourceId,
    source: &SourceDescriptor,
    remote_name: &str,
) -> Result<Oid, GitError> {
    for leftover in paths.leftover_dirs(id) {
        log::debug!("removing leftover {}", leftover.display());
        if let Err(err) = swap::remove_path(&leftover) {
            log::warn!("could not remove {}: {}", leftover.display(), err);
        }
    }

    let unique = swap::unique_suffix();
    let staging = paths.staging_dir(id, &unique);
    log::info!(
        "cloning {} (branch {}): source={}",
        source.url,
        source.branch,
        id.short()
    );

    let cloned = cache::clone_branch(
        &source.url,
        &source.branch,
        remote_name,
        &staging,
        &source.auth,
    )
    .and_then(|repo| cache::head_commit(&repo));
    let head = match cloned {
        Ok(head) => head,
        Err(err) => {
            let _ = swap::remove_path(&staging);
            return Err(err);
        }
    };

    let target = paths.clone_dir(id);
    if let Err(err) = swap::replace_dir(&staging, &target, &paths.trash_dir(id, &unique)) {
        let _ = swap::remove_path(&staging);
        return Err(GitError::Io(err));
    }
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingNotifier, RemoteFixture};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        remote: RemoteFixture,
        base: TempDir,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                remote: RemoteFixture::new(),
                base: tempfile::tempdir().unwrap(),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn paths(&self) -> SourcePaths {
            SourcePaths::new(self.base.path())
        }

        fn source(&self, branch: &str) -> SourceDescriptor {
            SourceDescriptor::new(self.remote.url(), branch)
        }

        fn fetcher(&self) -> GitSourceFetcher {
            self.fetcher_for(self.source("main"))
        }

        fn fetcher_for(&self, source: SourceDescriptor) -> GitSourceFetcher {
            GitSourceFetcher::new(self.paths(), source, self.notifier.clone())
        }

        fn calls(&self) -> Vec<(Option<String>, String)> {
            self.notifier.calls()
        }
    }

    fn s(oid: Oid) -> String {
        oid.to_string()
    }

    #[test]
    fn decide_follows_rule_order() {
        use FetchDecision::*;
        assert_eq!(FetchDecision::decide(true, false, Some(true)), Forced);
        assert_eq!(FetchDecision::decide(false, false, Some(true)), BranchMissing);
        assert_eq!(FetchDecision::decide(false, true, Some(true)), HintPresent);
        assert_eq!(FetchDecision::decide(false, true, Some(false)), HintUnresolved);
        assert_eq!(FetchDecision::decide(false, true, None), NoHint);

        assert!(Forced.should_fetch());
        assert!(BranchMissing.should_fetch());
        assert!(HintUnresolved.should_fetch());
        assert!(!HintPresent.should_fetch());
        assert!(!NoHint.should_fetch());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn four_call_scenario() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "package a")], "c1");
        let fetcher = h.fetcher();

        fetcher.synchronize(None, false).await.unwrap();
        assert_eq!(h.calls(), vec![(None, s(c1))]);

        let c2 = h.remote.commit("main", &[("a.rego", "package a2")], "c2");
        fetcher.synchronize(None, false).await.unwrap();
        assert_eq!(h.calls().len(), 1);

        fetcher.synchronize(None, true).await.unwrap();
        assert_eq!(h.calls(), vec![(None, s(c1)), (Some(s(c1)), s(c2))]);

        fetcher.synchronize(None, false).await.unwrap();
        assert_eq!(h.calls().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_forced_sync_is_idempotent() {
        let h = Harness::new();
        h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();

        fetcher.synchronize(None, false).await.unwrap();
        fetcher.synchronize(None, true).await.unwrap();
        fetcher.synchronize(None, true).await.unwrap();

        assert_eq!(h.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn present_hint_skips_fetch() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();
        fetcher.synchronize(None, false).await.unwrap();

        let c2 = h.remote.commit("main", &[("a.rego", "2")], "c2");
        fetcher.synchronize(Some(&s(c1)), false).await.unwrap();
        assert_eq!(h.calls().len(), 1);

        fetcher.synchronize(Some(&s(c2)), false).await.unwrap();
        assert_eq!(h.calls(), vec![(None, s(c1)), (Some(s(c1)), s(c2))]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_hint_forces_fetch() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();
        fetcher.synchronize(None, false).await.unwrap();

        let c2 = h.remote.commit("main", &[("a.rego", "2")], "c2");
        fetcher.synchronize(Some("not-a-commit"), false).await.unwrap();

        assert_eq!(h.calls().last(), Some(&(Some(s(c1)), s(c2))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repairs_after_external_deletion() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();
        fetcher.synchronize(None, false).await.unwrap();

        std::fs::remove_dir_all(fetcher.clone_path()).unwrap();
        fetcher.synchronize(None, false).await.unwrap();

        assert_eq!(h.calls(), vec![(None, s(c1)), (None, s(c1))]);
        assert!(cache::has_clone(fetcher.clone_path()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replaces_clone_of_another_remote() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();

        let foreign = Repository::init(fetcher.clone_path()).unwrap();
        foreign
            .remote("origin", "https://example.com/elsewhere.git")
            .unwrap();
        std::fs::write(fetcher.clone_path().join("stale.txt"), "stale").unwrap();
        drop(foreign);

        fetcher.synchronize(None, false).await.unwrap();

        assert_eq!(h.calls(), vec![(None, s(c1))]);
        assert!(!fetcher.clone_path().join("stale.txt").exists());
        assert!(fetcher.clone_path().join("a.rego").exists());
        let repo = Repository::open(fetcher.clone_path()).unwrap();
        assert_eq!(
            cache::verify_remote_url(&repo, &h.remote.url()).unwrap(),
            "origin"
        );
        assert!(h.paths().leftover_dirs(fetcher.source_id()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replaces_directory_that_is_not_a_clone() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();
        std::fs::create_dir_all(fetcher.clone_path().join("junk")).unwrap();

        fetcher.synchronize(None, false).await.unwrap();

        assert_eq!(h.calls(), vec![(None, s(c1))]);
        assert!(!fetcher.clone_path().join("junk").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removes_leftover_staging_dirs_before_clone() {
        let h = Harness::new();
        h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();
        let leftover = h.paths().staging_dir(fetcher.source_id(), "99.0");
        std::fs::create_dir_all(leftover.join("half")).unwrap();

        fetcher.synchronize(None, false).await.unwrap();

        assert!(!leftover.exists());
        assert!(cache::has_clone(fetcher.clone_path()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_clone_is_absorbed() {
        let h = Harness::new();
        let missing = h.base.path().join("no-such-remote.git");
        let fetcher = h.fetcher_for(SourceDescriptor::new(missing.to_str().unwrap(), "main"));

        fetcher.synchronize(None, false).await.unwrap();

        assert!(h.calls().is_empty());
        assert!(!fetcher.clone_path().exists());
        assert!(h.paths().leftover_dirs(fetcher.source_id()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_fetch_is_absorbed() {
        let h = Harness::new();
        h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();
        fetcher.synchronize(None, false).await.unwrap();

        std::fs::remove_dir_all(h.remote.path()).unwrap();
        fetcher.synchronize(None, true).await.unwrap();

        assert_eq!(h.calls().len(), 1);
        assert!(cache::has_clone(fetcher.clone_path()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_branch_on_shared_clone_starts_from_none() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        h.fetcher().synchronize(None, false).await.unwrap();

        let d1 = h.remote.commit("dev", &[("b.rego", "1")], "d1");
        let dev = h.fetcher_for(h.source("dev"));
        assert_eq!(dev.clone_path(), h.fetcher().clone_path());

        dev.synchronize(None, false).await.unwrap();
        dev.synchronize(None, false).await.unwrap();

        assert_eq!(h.calls(), vec![(None, s(c1)), (None, s(d1))]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_branch_ends_cycle_quietly() {
        let h = Harness::new();
        h.remote.commit("main", &[("a.rego", "1")], "c1");
        h.fetcher().synchronize(None, false).await.unwrap();

        let ghost = h.fetcher_for(h.source("ghost"));
        ghost.synchronize(None, false).await.unwrap();

        assert_eq!(h.calls().len(), 1);
    }

    #[test]
    fn anchor_falls_back_to_base_branch() {
        let remote = RemoteFixture::new();
        let c1 = remote.commit("main", &[("a", "1")], "c1");
        let dir = tempfile::tempdir().unwrap();
        let repo = cache::clone_branch(
            &remote.url(),
            "main",
            "origin",
            &dir.path().join("c"),
            &crate::types::SourceAuth::None,
        )
        .unwrap();

        let source = SourceDescriptor::new(remote.url(), "feature").with_base_branch("main");
        assert_eq!(tracking_anchor(&repo, "origin", &source).unwrap(), c1);

        let source = SourceDescriptor::new(remote.url(), "feature").with_base_branch("develop");
        match tracking_anchor(&repo, "origin", &source) {
            Err(FetchError::MissingBranch {
                branch,
                base_branch,
                remote,
            }) => {
                assert_eq!(branch, "feature");
                assert_eq!(base_branch, "develop");
                assert_eq!(remote, "origin");
            }
            other => panic!("expected MissingBranch, got {:?}", other),
        }
    }

    #[test]
    fn detect_change_reports_first_sighting_and_advance() {
        let remote = RemoteFixture::new();
        let c1 = remote.commit("main", &[("a", "1")], "c1");
        let dir = tempfile::tempdir().unwrap();
        let repo = cache::clone_branch(
            &remote.url(),
            "main",
            "origin",
            &dir.path().join("c"),
            &crate::types::SourceAuth::None,
        )
        .unwrap();
        let main = SourceDescriptor::new(remote.url(), "main");
        assert_eq!(
            detect_change(&repo, "origin", &main).unwrap(),
            Change::Unchanged(c1)
        );

        let c2 = remote.commit("main", &[("a", "2")], "c2");
        cache::fetch_remote(&repo, "origin", &main.auth).unwrap();
        assert_eq!(
            detect_change(&repo, "origin", &main).unwrap(),
            Change::Advanced {
                old: Some(c1),
                new: c2
            }
        );

        let other = SourceDescriptor::new(remote.url(), "other");
        assert_eq!(
            detect_change(&repo, "origin", &other).unwrap(),
            Change::HeadUnresolvable
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_syncs_of_one_source_are_serialized() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let locks = Arc::new(SourceLocks::new());
        let first = h.fetcher().with_locks(Arc::clone(&locks));
        let second = h.fetcher().with_locks(Arc::clone(&locks));

        let (a, b) = tokio::join!(
            first.synchronize(None, false),
            second.synchronize(None, false)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(h.calls(), vec![(None, s(c1))]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn separate_registries_still_exclude_through_lock_file() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let first = h.fetcher();
        let second = h.fetcher();

        let (a, b) = tokio::join!(
            first.synchronize(None, false),
            second.synchronize(None, false)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(h.calls(), vec![(None, s(c1))]);
        assert!(h.paths().lock_path(first.source_id()).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn held_lock_does_not_block_other_sources() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let other_remote = RemoteFixture::new();
        other_remote.commit("main", &[("b.rego", "1")], "b");

        let locks = Arc::new(SourceLocks::new());
        let fetcher = h.fetcher().with_locks(Arc::clone(&locks));
        let other = h
            .fetcher_for(SourceDescriptor::new(other_remote.url(), "main"))
            .with_locks(Arc::clone(&locks));

        let held = locks
            .acquire(other.source_id(), &h.paths().lock_path(other.source_id()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(30), fetcher.synchronize(None, false))
            .await
            .expect("sync of an unlocked source must not wait")
            .unwrap();
        assert_eq!(h.calls(), vec![(None, s(c1))]);

        let blocked =
            tokio::time::timeout(Duration::from_millis(300), other.synchronize(None, false)).await;
        assert!(blocked.is_err());
        assert_eq!(h.calls().len(), 1);

        drop(held);
        other.synchronize(None, false).await.unwrap();
        assert_eq!(h.calls().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn custom_remote_name_is_used_for_clone() {
        let h = Harness::new();
        h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher().with_remote_name("upstream");

        fetcher.synchronize(None, false).await.unwrap();
        fetcher.synchronize(None, true).await.unwrap();

        let repo = Repository::open(fetcher.clone_path()).unwrap();
        assert_eq!(
            cache::verify_remote_url(&repo, &h.remote.url()).unwrap(),
            "upstream"
        );
        assert_eq!(h.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn make_bundle_full_and_diff() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1"), ("b.rego", "1")], "c1");
        let fetcher = h.fetcher();
        fetcher.synchronize(None, false).await.unwrap();
        let c2 = h
            .remote
            .commit_with_removals("main", &[("a.rego", "2")], &["b.rego"], "c2");
        fetcher.synchronize(None, true).await.unwrap();

        let full = fetcher.make_bundle(None).await.unwrap();
        assert_eq!(full.hash, s(c2));
        assert_eq!(full.old_hash, None);
        assert_eq!(full.manifest, vec!["a.rego"]);

        let diff = fetcher.make_bundle(Some(&s(c1))).await.unwrap();
        assert_eq!(diff.old_hash, Some(s(c1)));
        assert_eq!(diff.file("a.rego").unwrap().contents, "2");
        assert_eq!(diff.deleted_files, vec!["b.rego"]);

        assert_eq!(fetcher.current_head().await.unwrap(), s(c2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn make_bundle_unknown_base_falls_back_to_full() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let fetcher = h.fetcher();
        fetcher.synchronize(None, false).await.unwrap();

        for base in ["0123456789abcdef0123456789abcdef01234567", "garbage", ""] {
            let bundle = fetcher.make_bundle(Some(base)).await.unwrap();
            assert_eq!(bundle.hash, s(c1));
            assert_eq!(bundle.old_hash, None);
            assert_eq!(bundle.files.len(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn make_bundle_without_branch_head_is_error() {
        let h = Harness::new();
        h.remote.commit("main", &[("a.rego", "1")], "c1");
        h.fetcher().synchronize(None, false).await.unwrap();

        let ghost = h.fetcher_for(h.source("ghost"));
        assert!(matches!(
            ghost.make_bundle(None).await,
            Err(FetchError::BranchHeadNotFound(branch)) if branch == "ghost"
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn make_bundle_without_clone_is_error() {
        let h = Harness::new();
        let fetcher = h.fetcher();
        assert!(matches!(
            fetcher.make_bundle(None).await,
            Err(FetchError::Git(GitError::NotFound(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn make_bundle_skips_binary_files() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "package a")], "c1");
        h.remote
            .commit_bytes("main", "logo.png", &[0x89, 0x50, 0x4e, 0x47, 0xff, 0xfe]);
        let fetcher = h.fetcher();
        fetcher.synchronize(None, false).await.unwrap();

        let full = fetcher.make_bundle(None).await.unwrap();
        assert_eq!(full.manifest, vec!["a.rego"]);
        assert!(full.file("logo.png").is_none());

        let fallback = fetcher.make_bundle(Some("unresolvable")).await.unwrap();
        assert_eq!(fallback, full);

        let diff = fetcher.make_bundle(Some(&s(c1))).await.unwrap();
        assert!(diff.files.is_empty());
    }

    /// Records the tracking ref as seen from inside each notification.
    struct RefObservingNotifier {
        clone_path: PathBuf,
        branch: String,
        seen: std::sync::Mutex<Vec<(Option<String>, String, Option<Oid>)>>,
    }

    #[async_trait]
    impl ChangeNotifier for RefObservingNotifier {
        async fn on_update(&self, old_revision: Option<String>, new_revision: String) {
            let repo = Repository::open(&self.clone_path).unwrap();
            let tracking = cache::local_branch_commit(&repo, &self.branch);
            self.seen
                .lock()
                .unwrap()
                .push((old_revision, new_revision, tracking));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tracking_ref_advances_only_after_notification() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let source = h.source("main");
        let notifier = Arc::new(RefObservingNotifier {
            clone_path: h.paths().clone_dir(&source.source_id()),
            branch: "main".into(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let fetcher = GitSourceFetcher::new(h.paths(), source, notifier.clone());

        fetcher.synchronize(None, false).await.unwrap();
        let c2 = h.remote.commit("main", &[("a.rego", "2")], "c2");
        fetcher.synchronize(None, true).await.unwrap();

        let seen = notifier.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (Some(s(c1)), s(c2), Some(c1)));

        let repo = Repository::open(fetcher.clone_path()).unwrap();
        assert_eq!(cache::local_branch_commit(&repo, "main"), Some(c2));
    }

    struct BundlingNotifier {
        fetcher: std::sync::OnceLock<Arc<GitSourceFetcher>>,
        bundles: std::sync::Mutex<Vec<Bundle>>,
    }

    #[async_trait]
    impl ChangeNotifier for BundlingNotifier {
        async fn on_update(&self, old_revision: Option<String>, _new_revision: String) {
            let fetcher = self.fetcher.get().unwrap();
            let bundle = fetcher.make_bundle(old_revision.as_deref()).await.unwrap();
            self.bundles.lock().unwrap().push(bundle);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notifier_can_build_bundles_while_sync_holds_lock() {
        let h = Harness::new();
        let c1 = h.remote.commit("main", &[("a.rego", "1")], "c1");
        let notifier = Arc::new(BundlingNotifier {
            fetcher: std::sync::OnceLock::new(),
            bundles: std::sync::Mutex::new(Vec::new()),
        });
        let fetcher = Arc::new(GitSourceFetcher::new(
            h.paths(),
            h.source("main"),
            notifier.clone(),
        ));
        let _ = notifier.fetcher.set(Arc::clone(&fetcher));

        fetcher.synchronize(None, false).await.unwrap();
        let c2 = h.remote.commit("main", &[("a.rego", "2")], "c2");
        fetcher.synchronize(None, true).await.unwrap();

        let bundles = notifier.bundles.lock().unwrap().clone();
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].hash, s(c1));
        assert_eq!(bundles[0].old_hash, None);
        assert_eq!(bundles[1].hash, s(c2));
        assert_eq!(bundles[1].old_hash, Some(s(c1)));
    }
}
