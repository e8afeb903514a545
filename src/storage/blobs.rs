//! External value storage: one file per blob under `<root>/data/`.
//!
//! Writes go through a temp file followed by a rename so a reader never
//! observes a partially written blob.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub(crate) struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn write(&self, filename: &str, bytes: &[u8]) -> io::Result<()> {
        let tmp = self.root.join(format!(".{filename}.tmp"));
        {
            let file = fs::File::create(&tmp)?;
            use std::io::Write;
            let mut file = file;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path(filename))?;
        Ok(())
    }

    pub fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(filename))
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path(filename).is_file()
    }

    /// Best-effort delete: a missing file is not an error, since the blob may
    /// already have been cleaned up by a previous, partially-failed operation.
    pub fn delete(&self, filename: &str) -> io::Result<()> {
        match fs::remove_file(self.path(filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All filenames currently present in `data/`, for the orphan-scan during
    /// startup reconciliation.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            out.push(name);
        }
        Ok(out)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
