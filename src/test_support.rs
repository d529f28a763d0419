//! Fixtures shared by the unit tests: a bare repository standing in for a
//! remote, and a notifier that records every call.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use git2::{Index, IndexEntry, IndexTime, Oid, Repository, Signature, Time};
use tempfile::TempDir;

use crate::fetcher::ChangeNotifier;

static CLOCK: AtomicI64 = AtomicI64::new(1_700_000_000);

/// A bare repository on local disk, addressed by its path as the remote URL.
pub struct RemoteFixture {
    dir: TempDir,
}

impl RemoteFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Repository::init_bare(dir.path().join("remote.git")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("remote.git")
    }

    pub fn url(&self) -> String {
        self.path().to_str().unwrap().to_string()
    }

    fn repo(&self) -> Repository {
        Repository::open_bare(self.path()).unwrap()
    }

    /// Commit `files` on top of `branch` (creating the branch if needed).
    pub fn commit(&self, branch: &str, files: &[(&str, &str)], message: &str) -> Oid {
        self.commit_with_removals(branch, files, &[], message)
    }

    /// Commit a single file with arbitrary (possibly binary) contents.
    pub fn commit_bytes(&self, branch: &str, path: &str, contents: &[u8]) -> Oid {
        self.write_commit(branch, &[(path, contents)], &[], &format!("add {}", path))
    }

    /// Commit `files` and delete `removed` on top of `branch`.
    pub fn commit_with_removals(
        &self,
        branch: &str,
        files: &[(&str, &str)],
        removed: &[&str],
        message: &str,
    ) -> Oid {
        let files: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(path, contents)| (*path, contents.as_bytes()))
            .collect();
        self.write_commit(branch, &files, removed, message)
    }

    fn write_commit(
        &self,
        branch: &str,
        files: &[(&str, &[u8])],
        removed: &[&str],
        message: &str,
    ) -> Oid {
        let repo = self.repo();
        let refname = format!("refs/heads/{}", branch);
        let parent = repo
            .find_reference(&refname)
            .and_then(|r| r.peel_to_commit())
            .ok();

        let mut index = Index::new().unwrap();
        if let Some(parent) = &parent {
            index.read_tree(&parent.tree().unwrap()).unwrap();
        }
        for (path, contents) in files {
            let blob = repo.blob(contents).unwrap();
            index.add(&index_entry(path, blob, contents.len())).unwrap();
        }
        for path in removed {
            index.remove(Path::new(path), 0).unwrap();
        }
        let tree_id = index.write_tree_to(&repo).unwrap();
        let tree = repo.find_tree(tree_id).unwrap();

        let seconds = CLOCK.fetch_add(1, Ordering::SeqCst);
        let sig = Signature::new("Test User", "test@example.com", &Time::new(seconds, 0)).unwrap();
        let parents: Vec<_> = parent.iter().collect();
        repo.commit(Some(&refname), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }
}

fn index_entry(path: &str, id: Oid, size: usize) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: 0o100644,
        uid: 0,
        gid: 0,
        file_size: size as u32,
        id,
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

/// Notifier that records every `(old, new)` pair it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(Option<String>, String)>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<(Option<String>, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeNotifier for RecordingNotifier {
    async fn on_update(&self, old_revision: Option<String>, new_revision: String) {
        self.calls.lock().unwrap().push((old_revision, new_revision));
    }
}
