use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fs2::FileExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::SourceId;

/// Default interval between lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A guard that holds an exclusive flock on a lock file.
/// Lock is released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

impl FileLock {
    /// Try to acquire the lock without blocking.
    /// Returns None if the lock is held elsewhere.
    /// Creates the lock file and parent dirs if needed.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn check_timeout(start: Instant, timeout: Option<Duration>) -> io::Result<()> {
    match timeout {
        Some(timeout) if start.elapsed() >= timeout => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("lock acquisition timed out after {:?}", timeout),
        )),
        _ => Ok(()),
    }
}

/// Which callers a source lock excludes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockScope {
    /// Tasks sharing one `SourceLocks` registry.
    Process,
    /// Additionally any process locking the same file under `.locks/`.
    #[default]
    CrossProcess,
}

/// Holds exclusive ownership of a source until dropped.
#[derive(Debug)]
pub struct SourceLockGuard {
    // Field order matters: the file lock is released before the in-process
    // mutex so a waiter in this process never polls a still-held flock.
    _file: Option<FileLock>,
    _local: OwnedMutexGuard<()>,
    id: SourceId,
}

impl Drop for SourceLockGuard {
    fn drop(&mut self) {
        log::debug!("releasing lock: source={}", self.id.short());
    }
}

/// Registry of named locks keyed by source identity.
///
/// Each id maps to its own async mutex, so waiters on different sources never
/// contend. With `LockScope::CrossProcess` the mutex is followed by an flock on
/// the source's lock file, polled at `poll_interval`.
#[derive(Debug)]
pub struct SourceLocks {
    locks: DashMap<SourceId, Arc<Mutex<()>>>,
    scope: LockScope,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl Default for SourceLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceLocks {
    /// Create a cross-process registry polling every 100 ms with no timeout.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            scope: LockScope::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    pub fn with_scope(mut self, scope: LockScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Give up on the file lock after `timeout` with `ErrorKind::TimedOut`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    fn local_mutex(&self, id: &SourceId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire exclusive ownership of `id`, waiting as long as needed.
    ///
    /// `lock_path` is only touched for `LockScope::CrossProcess`.
    pub async fn acquire(&self, id: &SourceId, lock_path: &Path) -> io::Result<SourceLockGuard> {
        log::debug!("trying to acquire lock: source={}", id.short());
        let start = Instant::now();

        let local = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.local_mutex(id).lock_owned())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("lock acquisition timed out after {:?}", timeout),
                    )
                })?,
            None => self.local_mutex(id).lock_owned().await,
        };

        let file = match self.scope {
            LockScope::Process => None,
            LockScope::CrossProcess => loop {
                if let Some(lock) = FileLock::try_acquire(lock_path)? {
                    break Some(lock);
                }
                check_timeout(start, self.timeout)?;
                tokio::time::sleep(self.poll_interval).await;
            },
        };

        log::debug!("lock acquired: source={}", id.short());
        Ok(SourceLockGuard {
            _file: file,
            _local: local,
            id: id.clone(),
        })
    }
}
