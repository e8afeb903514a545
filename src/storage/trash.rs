//! Fast wipe: moving the live directories aside is O(1) on most filesystems;
//! actually freeing the disk space happens on a detached thread afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub(crate) fn open(root: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    Ok(root.to_path_buf())
}

/// A fresh, uniquely-named subdirectory of `trash/` to rename things into.
pub(crate) fn new_slot(trash_root: &Path) -> PathBuf {
    trash_root.join(Uuid::new_v4().to_string())
}

/// Hand a trash subdirectory off to a background thread for deletion. Returns
/// immediately; the caller's fast-wipe call is done as soon as this returns.
pub(crate) fn dispatch_deletion(dir: PathBuf) {
    std::thread::spawn(move || {
        if let Err(err) = fs::remove_dir_all(&dir) {
            tracing::warn!(path = %dir.display(), %err, "failed to empty trash directory");
        }
    });
}

/// Resume deletion of any `trash/*` directories left over from a previous
/// process that didn't get to finish (e.g. it was killed mid-wipe).
pub(crate) fn resume_pending(trash_root: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(trash_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dispatch_deletion(entry.path());
        }
    }
    Ok(())
}
