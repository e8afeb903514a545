//! The persistent hybrid store: a relational index (`manifest.sqlite`) plus an
//! on-disk blob directory (`data/`), with LRU eviction and a trash-based fast
//! wipe.
//!
//! None of `KvStorage`'s methods synchronize internally — every method except
//! the handful of pure readers takes `&mut self`, so the borrow checker is the
//! enforcement mechanism for "caller serializes access". In this crate the
//! single caller is the [`crate::coordinator`] worker thread.

mod blobs;
mod index;
mod trash;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IndexError, Result, StorageError};
use crate::item::{now_secs, Item, ItemInfo, StorageType};

use blobs::BlobStore;
use index::SqliteIndex;

pub struct KvStorage {
    root: PathBuf,
    storage_type: StorageType,
    index: Option<SqliteIndex>,
    blobs: BlobStore,
    trash_root: PathBuf,
    error_logs_enabled: bool,
}

impl KvStorage {
    /// Open (or create) a store rooted at `root`. Creates `data/`, `trash/`
    /// and the index on first use.
    pub fn open(root: impl AsRef<Path>, storage_type: StorageType) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let data_dir = root.join("data");
        let trash_dir = root.join("trash");
        let manifest_path = root.join("manifest.sqlite");

        let blobs = BlobStore::open(&data_dir)?;
        trash::open(&trash_dir)?;

        let index = match SqliteIndex::open(&manifest_path, storage_type) {
            Ok(idx) => idx,
            Err(IndexError::TypeMismatch) => return Err(StorageError::TypeMismatch),
            Err(other) => {
                tracing::warn!(
                    path = %manifest_path.display(),
                    error = %other,
                    "index unreadable, discarding and rebuilding; surviving blobs become orphans"
                );
                discard_index_files(&manifest_path);
                SqliteIndex::open(&manifest_path, storage_type).map_err(|_| StorageError::Failed)?
            }
        };

        let mut store = Self {
            root,
            storage_type,
            index: Some(index),
            blobs,
            trash_root: trash_dir,
            error_logs_enabled: false,
        };
        store.reconcile_at_startup();
        Ok(store)
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn is_failed(&self) -> bool {
        self.index.is_none()
    }

    pub fn set_error_logs_enabled(&mut self, enabled: bool) {
        self.error_logs_enabled = enabled;
    }

    fn note(&self, context: &str, err: impl std::fmt::Display) {
        if self.error_logs_enabled {
            tracing::warn!(context, %err, "kv storage operation failed");
        } else {
            tracing::debug!(context, %err, "kv storage operation failed");
        }
    }

    fn reconcile_at_startup(&mut self) {
        let Some(index) = self.index.as_ref() else {
            return;
        };

        match index.external_rows() {
            Ok(rows) => {
                for (key, filename) in rows {
                    if !self.blobs.exists(&filename) {
                        tracing::warn!(key, filename, "row references missing blob, dropping row");
                        let _ = index.remove_missing_blob_row(&key);
                    }
                }
            }
            Err(e) => self.note("reconcile:rows", e),
        }

        let referenced = match self.index.as_ref().unwrap().all_filenames() {
            Ok(r) => r,
            Err(e) => {
                self.note("reconcile:filenames", e);
                Default::default()
            }
        };
        match self.blobs.list() {
            Ok(files) => {
                for file in files {
                    if !referenced.contains(&file) {
                        tracing::debug!(file, "deleting orphaned blob with no referencing row");
                        let _ = self.blobs.delete(&file);
                    }
                }
            }
            Err(e) => self.note("reconcile:orphan-scan", e),
        }

        if let Err(e) = trash::resume_pending(&self.trash_root) {
            self.note("reconcile:trash", e);
        }
    }

    fn effective_filename(&self, requested: Option<String>) -> std::result::Result<Option<String>, StorageError> {
        match self.storage_type {
            StorageType::Sqlite => Ok(None),
            StorageType::File => requested.ok_or(StorageError::FilenameRequired).map(Some),
            StorageType::Mixed => Ok(requested),
        }
    }

    /// Save an item, or replace it if `item.key` already exists.
    pub fn save(&mut self, mut item: Item) -> bool {
        let Some(index) = self.index.as_ref() else {
            return false;
        };
        if item.key.is_empty() || item.value.is_empty() {
            return false;
        }

        let filename = match self.effective_filename(item.filename.take()) {
            Ok(f) => f,
            Err(e) => {
                self.note("save", e);
                return false;
            }
        };
        item.filename = filename.clone();
        item.size = item.value.len() as i64;

        let prior_filename = match index.filename_for(&item.key) {
            Ok(f) => f.flatten(),
            Err(e) => {
                self.note("save:lookup", e);
                return false;
            }
        };

        if let Some(fname) = &filename {
            if let Err(e) = self.blobs.write(fname, &item.value) {
                self.note("save:blob-write", e);
                return false;
            }
        }

        let index = self.index.as_ref().unwrap();
        if let Err(e) = index.upsert(&item) {
            self.note("save:index", e);
            if let Some(fname) = &filename {
                let _ = self.blobs.delete(fname);
            }
            return false;
        }

        if let Some(prior) = prior_filename {
            if filename.as_deref() != Some(prior.as_str()) {
                let _ = self.blobs.delete(&prior);
            }
        }

        true
    }

    /// Inline save of a raw key/value pair. Fails when the store is `File`-typed.
    pub fn save_kv(&mut self, key: impl Into<String>, value: Vec<u8>) -> bool {
        if self.storage_type == StorageType::File {
            return false;
        }
        self.save(Item::new(key, value))
    }

    pub fn get(&mut self, key: &str) -> Option<Item> {
        let index = self.index.as_ref()?;
        let mut item = match index.get(key) {
            Ok(Some(item)) => item,
            Ok(None) => return None,
            Err(e) => {
                self.note("get", e);
                return None;
            }
        };

        if let Some(filename) = &item.filename {
            match self.blobs.read(filename) {
                Ok(bytes) => item.value = bytes,
                Err(_) => {
                    tracing::warn!(key, filename, "blob missing for known row, dropping row");
                    let _ = self.index.as_ref().unwrap().remove_missing_blob_row(key);
                    return None;
                }
            }
        }

        let now = now_secs();
        let _ = self.index.as_ref().unwrap().touch_access_time(key, now);
        item.access_time = now;
        Some(item)
    }

    pub fn get_info(&self, key: &str) -> Option<ItemInfo> {
        let index = self.index.as_ref()?;
        match index.get_info(key) {
            Ok(info) => info,
            Err(e) => {
                self.note("get_info", e);
                None
            }
        }
    }

    pub fn get_value(&mut self, key: &str) -> Option<Vec<u8>> {
        self.get(key).map(|item| item.value)
    }

    pub fn get_batch(&mut self, keys: &[String]) -> Vec<Item> {
        keys.iter().filter_map(|k| self.get(k)).collect()
    }

    /// Every key currently in the index, oldest-access-first is not
    /// guaranteed; used by callers that need to chunk over the whole store
    /// (e.g. a progress-reporting wipe).
    pub fn all_keys(&self) -> Vec<String> {
        match &self.index {
            Some(index) => index.all_keys().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn get_info_batch(&self, keys: &[String]) -> Vec<ItemInfo> {
        keys.iter().filter_map(|k| self.get_info(k)).collect()
    }

    pub fn get_value_batch(&mut self, keys: &[String]) -> Vec<(String, Vec<u8>)> {
        keys.iter()
            .filter_map(|k| self.get_value(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn exists(&self, key: &str) -> bool {
        match &self.index {
            Some(index) => index.exists(key).unwrap_or(false),
            None => false,
        }
    }

    pub fn count(&self) -> i64 {
        match &self.index {
            Some(index) => index.count().unwrap_or(-1),
            None => -1,
        }
    }

    pub fn total_size(&self) -> i64 {
        match &self.index {
            Some(index) => index.total_size().unwrap_or(-1),
            None => -1,
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(index) = self.index.as_ref() else {
            return false;
        };
        match index.remove(key) {
            Ok(filename) => {
                if let Some(f) = filename {
                    let _ = self.blobs.delete(&f);
                }
                true
            }
            Err(e) => {
                self.note("remove", e);
                false
            }
        }
    }

    pub fn remove_batch(&mut self, keys: &[String]) -> bool {
        let Some(index) = self.index.as_mut() else {
            return false;
        };
        match index.remove_keys_batch(keys) {
            Ok(filenames) => {
                for filename in filenames.into_iter().flatten() {
                    let _ = self.blobs.delete(&filename);
                }
                true
            }
            Err(e) => {
                self.note("remove_batch", e);
                false
            }
        }
    }

    pub fn remove_larger_than(&mut self, size: i64) -> bool {
        let Some(index) = self.index.as_ref() else {
            return false;
        };
        match index.remove_larger_than(size) {
            Ok(filenames) => {
                for f in filenames {
                    let _ = self.blobs.delete(&f);
                }
                true
            }
            Err(e) => {
                self.note("remove_larger_than", e);
                false
            }
        }
    }

    pub fn remove_earlier_than(&mut self, time: i64) -> bool {
        let Some(index) = self.index.as_ref() else {
            return false;
        };
        match index.remove_earlier_than(time) {
            Ok(filenames) => {
                for f in filenames {
                    let _ = self.blobs.delete(&f);
                }
                true
            }
            Err(e) => {
                self.note("remove_earlier_than", e);
                false
            }
        }
    }

    /// LRU eviction until `total_size() <= max_bytes`, in batches.
    pub fn remove_to_fit_size(&mut self, max_bytes: i64) -> bool {
        loop {
            let Some(index) = self.index.as_mut() else {
                return false;
            };
            let total = match index.total_size() {
                Ok(t) => t,
                Err(e) => {
                    self.note("remove_to_fit_size", e);
                    return false;
                }
            };
            if total <= max_bytes {
                return true;
            }

            let victims = match self.index.as_mut().unwrap().evict_batch() {
                Ok(v) => v,
                Err(e) => {
                    self.note("remove_to_fit_size:evict", e);
                    return false;
                }
            };
            if victims.is_empty() {
                return true;
            }
            for victim in victims {
                if let Some(filename) = victim.filename {
                    let _ = self.blobs.delete(&filename);
                }
            }
        }
    }

    /// LRU eviction until `count() <= max_items`, in batches.
    pub fn remove_to_fit_count(&mut self, max_items: i64) -> bool {
        loop {
            let Some(index) = self.index.as_mut() else {
                return false;
            };
            let total = match index.count() {
                Ok(t) => t,
                Err(e) => {
                    self.note("remove_to_fit_count", e);
                    return false;
                }
            };
            if total <= max_items {
                return true;
            }

            let victims = match self.index.as_mut().unwrap().evict_batch() {
                Ok(v) => v,
                Err(e) => {
                    self.note("remove_to_fit_count:evict", e);
                    return false;
                }
            };
            if victims.is_empty() {
                return true;
            }
            for victim in victims {
                if let Some(filename) = victim.filename {
                    let _ = self.blobs.delete(&filename);
                }
            }
        }
    }

    /// Fast wipe: rename `data/` and the index into a fresh `trash/<uuid>/`
    /// slot, recreate empty ones, then dispatch deletion of the trash slot to
    /// a background thread. Returns once the rename has completed.
    ///
    /// A rename across filesystems (`trash/` on a different device than the
    /// root, e.g. a bind-mounted `data/`) can't be atomic; when that happens
    /// this falls back to deleting the offending directory in place before
    /// returning, trading the bounded-time guarantee for correctness.
    pub fn remove_all(&mut self) -> bool {
        if self.index.is_none() {
            return false;
        }

        let slot = trash::new_slot(&self.trash_root);
        if let Err(e) = fs::create_dir_all(&slot) {
            self.note("remove_all:mkdir", e);
            return false;
        }

        // Drop the connection before touching the underlying files.
        self.index = None;

        let manifest_path = self.root.join("manifest.sqlite");
        for suffix in ["", "-wal", "-shm"] {
            let src = PathBuf::from(format!("{}{suffix}", manifest_path.display()));
            if src.exists() {
                let dst = slot.join(format!("manifest.sqlite{suffix}"));
                if let Err(e) = fs::rename(&src, &dst) {
                    self.note("remove_all:rename-index", e);
                    if let Err(e) = fs::remove_file(&src) {
                        self.note("remove_all:fallback-delete-index", e);
                    }
                }
            }
        }

        let data_dst = slot.join("data");
        if self.blobs.root().exists() {
            if let Err(e) = fs::rename(self.blobs.root(), &data_dst) {
                self.note("remove_all:rename-data", e);
                if let Err(e) = fs::remove_dir_all(self.blobs.root()) {
                    self.note("remove_all:fallback-delete-data", e);
                }
            }
        }

        let data_dir = self.root.join("data");
        self.blobs = match BlobStore::open(&data_dir) {
            Ok(b) => b,
            Err(e) => {
                self.note("remove_all:recreate-data", e);
                return false;
            }
        };
        self.index = match SqliteIndex::open(&manifest_path, self.storage_type) {
            Ok(idx) => Some(idx),
            Err(e) => {
                self.note("remove_all:recreate-index", e);
                return false;
            }
        };

        trash::dispatch_deletion(slot);
        true
    }

    /// Slow, observable wipe: delete keys in chunks, reporting progress after
    /// each one and a final completion flag.
    pub fn remove_all_with_progress(
        &mut self,
        mut progress: impl FnMut(usize, usize),
        end: impl FnOnce(bool),
    ) {
        const CHUNK: usize = 32;

        let Some(index) = self.index.as_ref() else {
            end(true);
            return;
        };
        let keys = match index.all_keys() {
            Ok(k) => k,
            Err(e) => {
                self.note("remove_all_with_progress:keys", e);
                end(true);
                return;
            }
        };

        let total = keys.len();
        let mut removed = 0;
        for chunk in keys.chunks(CHUNK) {
            if !self.remove_batch(chunk) {
                end(true);
                return;
            }
            removed += chunk.len();
            progress(removed, total);
        }
        end(false);
    }
}

fn discard_index_files(manifest_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{suffix}", manifest_path.display()));
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::item::{default_filename, Item, StorageType};

    fn open_tmp(storage_type: StorageType) -> (KvStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = KvStorage::open(dir.path(), storage_type).unwrap();
        (storage, dir)
    }

    #[test]
    fn mixed_routes_by_presence_of_filename() {
        let (mut storage, dir) = open_tmp(StorageType::Mixed);

        assert!(storage.save_kv("k1", vec![1, 2, 3, 4, 5]));
        let big = vec![7u8; 100 * 1024];
        assert!(storage.save(Item::new("k2", big.clone()).with_filename("abc")));

        assert!(!dir.path().join("data").join("k1").exists());
        assert!(dir.path().join("data").join("abc").exists());
        assert_eq!(
            std::fs::metadata(dir.path().join("data").join("abc"))
                .unwrap()
                .len(),
            102_400
        );
        assert_eq!(storage.count(), 2);
        assert_eq!(storage.total_size(), 5 + 102_400);
    }

    #[test]
    fn file_type_rejects_inline_save() {
        let (mut storage, _dir) = open_tmp(StorageType::File);
        assert!(!storage.save_kv("k", vec![1]));
        assert!(storage.save(Item::new("k", vec![1]).with_filename(default_filename("k"))));
    }

    #[test]
    fn overwrite_replaces_value_and_removes_old_blob() {
        let (mut storage, dir) = open_tmp(StorageType::Mixed);
        let fname = default_filename("k");
        assert!(storage.save(Item::new("k", b"v1".to_vec()).with_filename(fname.clone())));
        assert!(storage.save_kv("k", b"v2".to_vec()));

        assert_eq!(storage.get_value("k").unwrap(), b"v2");
        assert!(!dir.path().join("data").join(fname).exists());
    }

    #[test]
    fn missing_blob_is_treated_as_absent_and_drops_row() {
        let (mut storage, dir) = open_tmp(StorageType::Mixed);
        assert!(storage.save(Item::new("k", b"v".to_vec()).with_filename("f")));
        std::fs::remove_file(dir.path().join("data").join("f")).unwrap();

        assert!(storage.get("k").is_none());
        assert!(!storage.exists("k"));
    }

    #[test]
    fn remove_to_fit_count_keeps_most_recent() {
        let (mut storage, _dir) = open_tmp(StorageType::Sqlite);
        for i in 0..10 {
            storage.save_kv(format!("k{i}"), vec![0u8; 8]);
            // ensure distinct access_time ordering even within the same second
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(storage.remove_to_fit_count(3));
        assert!(storage.count() <= 3);
        assert!(storage.exists("k9"));
        assert!(storage.exists("k8"));
        assert!(storage.exists("k7"));
        assert!(!storage.exists("k0"));
    }

    #[test]
    fn remove_to_fit_count_on_empty_store_succeeds() {
        let (mut storage, _dir) = open_tmp(StorageType::Sqlite);
        assert!(storage.remove_to_fit_count(10));
    }

    #[test]
    fn get_promotes_out_of_next_eviction_batch() {
        let (mut storage, _dir) = open_tmp(StorageType::Sqlite);
        storage.save_kv("old", vec![1]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        for i in 0..5 {
            storage.save_kv(format!("k{i}"), vec![1]);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // touch "old" so it's no longer the least recently used
        assert!(storage.get("old").is_some());
        assert!(storage.remove_to_fit_count(5));
        assert!(storage.exists("old"));
    }

    #[test]
    fn fast_remove_all_empties_store_and_is_reopenable() {
        let (mut storage, dir) = open_tmp(StorageType::Mixed);
        for i in 0..10 {
            storage.save(Item::new(format!("k{i}"), vec![1, 2, 3]).with_filename(format!("f{i}")));
        }
        assert!(storage.remove_all());
        assert_eq!(storage.count(), 0);

        drop(storage);
        let reopened = KvStorage::open(dir.path(), StorageType::Mixed).unwrap();
        assert_eq!(reopened.count(), 0);
    }

    #[test]
    fn type_mismatch_on_reopen_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _s = KvStorage::open(dir.path(), StorageType::Mixed).unwrap();
        }
        let reopened = KvStorage::open(dir.path(), StorageType::Sqlite);
        assert!(matches!(reopened, Err(StorageError::TypeMismatch)));
    }

    #[test]
    fn remove_all_with_progress_reports_every_chunk() {
        let (mut storage, _dir) = open_tmp(StorageType::Sqlite);
        for i in 0..40 {
            storage.save_kv(format!("k{i}"), vec![1]);
        }
        let mut calls = Vec::new();
        storage.remove_all_with_progress(
            |removed, total| calls.push((removed, total)),
            |errored| assert!(!errored),
        );
        assert_eq!(storage.count(), 0);
        assert_eq!(calls.last(), Some(&(40, 40)));
    }
}
