//! Staged directory replacement for clone repair.
//!
//! A fresh clone is built in a staging directory next to the target and moved
//! into place with renames, so an interrupted repair leaves either the old
//! clone, the new clone, or nothing at the target path. It never leaves a
//! half-deleted tree there.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for unique staging names within a process
static SWAP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A suffix unique across threads and processes: `{pid}.{counter}`.
pub fn unique_suffix() -> String {
    let counter = SWAP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}.{}", std::process::id(), counter)
}

/// Move `staged` to `target`, replacing whatever is at `target`.
///
/// An existing target is first renamed to `trash` and removed only after the
/// staged directory is in place. If the final rename fails the old target is
/// restored.
pub fn replace_dir(staged: &Path, target: &Path, trash: &Path) -> io::Result<()> {
    let had_target = std::fs::symlink_metadata(target).is_ok();
    if had_target {
        std::fs::rename(target, trash)?;
    }

    if let Err(e) = std::fs::rename(staged, target) {
        if had_target {
            let _ = std::fs::rename(trash, target);
        }
        return Err(e);
    }

    if had_target {
        remove_path(trash)?;
    }
    Ok(())
}

/// Remove a directory tree or a single file.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
